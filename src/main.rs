use std::{io::Read, path::PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use saml_sp::{
    config::{ConfigError, SamlSpConfig},
    observability::init_tracing,
    saml::{
        AuthRequest, AuthRequestError, Binding, RequestEncoding, ResponseError, ResponseValidator,
        TrustAnchor,
    },
};
use serde::Serialize;

#[derive(Parser)]
#[command(version, about = "SAML 2.0 service provider toolkit", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to config file (defaults to ./saml-sp.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Build an AuthnRequest for the configured IdP
    Request {
        /// Binding the IdP should answer with
        #[arg(long, value_enum, default_value_t = BindingArg::Redirect)]
        binding: BindingArg,
        /// Output encoding of the request
        #[arg(long, value_enum, default_value_t = EncodingArg::Base64Url)]
        encoding: EncodingArg,
        /// RelayState to carry through the IdP round trip
        #[arg(long)]
        relay_state: Option<String>,
        /// Print the full IdP redirect URL instead of the encoded request
        #[arg(long)]
        redirect_url: bool,
    },
    /// Validate a SAMLResponse and print a JSON report
    ///
    /// Exits with status 2 when the response is well-formed but its
    /// signature does not verify.
    Verify {
        /// File holding the response (reads stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Input is raw XML rather than base64
        #[arg(long)]
        xml: bool,
        /// Input is percent-encoded base64
        #[arg(long, conflicts_with = "xml")]
        url_encoded: bool,
    },
    /// Validate the configuration file and show the trusted certificate
    CheckConfig,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BindingArg {
    Redirect,
    Post,
}

impl From<BindingArg> for Binding {
    fn from(value: BindingArg) -> Self {
        match value {
            BindingArg::Redirect => Binding::HttpRedirect,
            BindingArg::Post => Binding::HttpPost,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EncodingArg {
    Raw,
    Base64,
    Url,
    Base64Url,
}

impl From<EncodingArg> for RequestEncoding {
    fn from(value: EncodingArg) -> Self {
        match value {
            EncodingArg::Raw => RequestEncoding::Raw,
            EncodingArg::Base64 => RequestEncoding::Base64,
            EncodingArg::Url => RequestEncoding::Url,
            EncodingArg::Base64Url => RequestEncoding::Base64Url,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Request(#[from] AuthRequestError),

    #[error(transparent)]
    Response(#[from] ResponseError),

    #[error("Failed to read input: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write report: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON report printed by `verify`. Identity fields are only filled in for
/// a response whose signature verified.
#[derive(Debug, Serialize)]
struct VerifyReport {
    valid: bool,
    reason: Option<String>,
    name_id: Option<String>,
    issuer: Option<String>,
    signed_element_id: Option<String>,
}

/// Resolve the config path: an explicit `--config`, else `saml-sp.toml` in
/// the current directory.
fn resolve_config_path(explicit_path: Option<&str>) -> Result<PathBuf, String> {
    if let Some(path) = explicit_path {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(format!("Config file not found: {}", path.display()));
        }
        return Ok(path);
    }

    let cwd_config = PathBuf::from("saml-sp.toml");
    if cwd_config.exists() {
        return Ok(cwd_config);
    }

    Err("No config file given and ./saml-sp.toml does not exist".to_string())
}

fn run_request(
    config: &SamlSpConfig,
    binding: Binding,
    encoding: RequestEncoding,
    relay_state: Option<&str>,
    redirect_url: bool,
) -> Result<(), CliError> {
    let request = AuthRequest::new(&config.sp);
    tracing::info!(request_id = %request.id(), "Created AuthnRequest");

    if redirect_url {
        println!("{}", request.redirect_url(binding, &config.idp, relay_state)?);
    } else {
        println!("{}", request.encode(binding, encoding)?);
    }
    Ok(())
}

fn run_verify(
    config: &SamlSpConfig,
    input: Option<PathBuf>,
    xml: bool,
    url_encoded: bool,
) -> Result<bool, CliError> {
    let raw = match input {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let validator = ResponseValidator::from_idp_config(&config.idp, config.validation.clone())?;
    let response = if xml {
        validator.load_xml(&raw)?
    } else {
        validator.load_encoded(raw.trim(), url_encoded)?
    };

    let report = match response.verified() {
        Ok(verified) => VerifyReport {
            valid: true,
            reason: None,
            name_id: verified.name_id().ok(),
            issuer: verified.issuer(),
            signed_element_id: verified.signed_element_id().map(str::to_string),
        },
        Err(e) => VerifyReport {
            valid: false,
            reason: Some(e.to_string()),
            name_id: None,
            issuer: None,
            signed_element_id: None,
        },
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.valid)
}

fn run_check_config(config: &SamlSpConfig) -> Result<(), CliError> {
    let anchor = TrustAnchor::parse(&config.idp.certificate).map_err(ConfigError::from)?;
    println!("Configuration OK");
    println!("  SP issuer:         {}", config.sp.issuer);
    println!("  ACS URL:           {}", config.sp.acs_url);
    println!("  IdP SSO URL:       {}", config.idp.sso_url);
    println!("  IdP certificate:   {}", anchor.subject());
    println!("  SHA-256:           {}", anchor.fingerprint_sha256());
    Ok(())
}

fn main() {
    let args = Args::parse();

    let config_path = match resolve_config_path(args.config.as_deref()) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let config = match SamlSpConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(&config.observability) {
        eprintln!("Warning: {e}");
    }
    tracing::debug!(config = %config_path.display(), "Loaded configuration");

    let result = match args.command {
        Command::Request {
            binding,
            encoding,
            relay_state,
            redirect_url,
        } => run_request(
            &config,
            binding.into(),
            encoding.into(),
            relay_state.as_deref(),
            redirect_url,
        ),
        Command::Verify {
            input,
            xml,
            url_encoded,
        } => match run_verify(&config, input, xml, url_encoded) {
            Ok(true) => Ok(()),
            Ok(false) => std::process::exit(2),
            Err(e) => Err(e),
        },
        Command::CheckConfig => run_check_config(&config),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Command failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
