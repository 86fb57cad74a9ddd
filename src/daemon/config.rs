use std::fmt::Write as _;
use std::path::PathBuf;

/// Lightning backend the daemon attaches to, or none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LightningNode {
    /// The daemon is its own Lightning endpoint.
    Standalone,
    Lnd {
        host: String,
        port: u16,
        macaroon_path: PathBuf,
        certificate_path: Option<PathBuf>,
    },
    Cln {
        host: String,
        port: u16,
        cert_dir: PathBuf,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("unsupported lightning backend: {0}")]
    UnsupportedBackend(String),
    #[error("connection string is missing `{0}`")]
    MissingField(&'static str),
    #[error("invalid `{field}`: {value}")]
    InvalidField { field: &'static str, value: String },
}

impl LightningNode {
    /// Parses a `key=value;key=value` connection string.
    ///
    /// Supported types are `lnd-grpc` (`server`, `macaroonfilepath`, optional
    /// `certfilepath`) and `clightning-grpc` (`server`, `certdir`). An empty
    /// string or `type=standalone` selects [`LightningNode::Standalone`].
    pub fn from_connection_string(s: &str) -> Result<Self, ConfigurationError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(LightningNode::Standalone);
        }

        let mut kind = None;
        let mut server = None;
        let mut macaroon = None;
        let mut cert = None;
        let mut cert_dir = None;
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = part.split_once('=') else {
                return Err(ConfigurationError::InvalidField {
                    field: "connection string",
                    value: part.to_string(),
                });
            };
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "type" => kind = Some(value),
                "server" => server = Some(value),
                "macaroonfilepath" => macaroon = Some(value),
                "certfilepath" => cert = Some(value),
                "certdir" => cert_dir = Some(value),
                _ => {}
            }
        }

        let kind = kind.ok_or(ConfigurationError::MissingField("type"))?;
        match kind.as_str() {
            "standalone" => Ok(LightningNode::Standalone),
            "lnd-grpc" => {
                let (host, port) =
                    parse_server(server.as_deref().ok_or(ConfigurationError::MissingField("server"))?)?;
                let macaroon_path = macaroon
                    .map(PathBuf::from)
                    .ok_or(ConfigurationError::MissingField("macaroonfilepath"))?;
                Ok(LightningNode::Lnd {
                    host,
                    port,
                    macaroon_path,
                    certificate_path: cert.map(PathBuf::from),
                })
            }
            "clightning-grpc" => {
                let (host, port) =
                    parse_server(server.as_deref().ok_or(ConfigurationError::MissingField("server"))?)?;
                let cert_dir = cert_dir
                    .map(PathBuf::from)
                    .ok_or(ConfigurationError::MissingField("certdir"))?;
                Ok(LightningNode::Cln {
                    host,
                    port,
                    cert_dir,
                })
            }
            other => Err(ConfigurationError::UnsupportedBackend(other.to_string())),
        }
    }

    pub fn is_standalone(&self) -> bool {
        matches!(self, LightningNode::Standalone)
    }
}

fn parse_server(server: &str) -> Result<(String, u16), ConfigurationError> {
    let invalid = || ConfigurationError::InvalidField {
        field: "server",
        value: server.to_string(),
    };
    let authority = server
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(server)
        .trim_end_matches('/');
    let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

/// Settings the supervisor always writes regardless of the node backend.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub network: String,
    pub rpc_host: String,
    pub rpc_port: u16,
    pub data_dir: PathBuf,
}

/// Renders `boltz.toml`.
pub fn render_config(settings: &DaemonSettings, node: &LightningNode) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_config(&mut out, settings, node);
    out
}

fn write_config(
    out: &mut String,
    settings: &DaemonSettings,
    node: &LightningNode,
) -> std::fmt::Result {
    writeln!(out, "network = {}", quoted(&settings.network))?;
    writeln!(out, "datadir = {}", quoted(settings.data_dir.display()))?;
    writeln!(out, "standalone = {}", node.is_standalone())?;
    writeln!(out)?;

    writeln!(out, "[RPC]")?;
    writeln!(out, "host = {}", quoted(&settings.rpc_host))?;
    writeln!(out, "port = {}", settings.rpc_port)?;
    writeln!(out, "noTls = true")?;
    writeln!(out, "noMacaroons = false")?;
    writeln!(
        out,
        "adminMacaroonPath = {}",
        quoted(settings.data_dir.join("macaroons").join("admin.macaroon").display())
    )?;

    match node {
        LightningNode::Standalone => {}
        LightningNode::Lnd {
            host,
            port,
            macaroon_path,
            certificate_path,
        } => {
            writeln!(out)?;
            writeln!(out, "[LND]")?;
            writeln!(out, "host = {}", quoted(host))?;
            writeln!(out, "port = {port}")?;
            writeln!(out, "macaroon = {}", quoted(macaroon_path.display()))?;
            if let Some(cert) = certificate_path {
                writeln!(out, "certificate = {}", quoted(cert.display()))?;
            }
        }
        LightningNode::Cln {
            host,
            port,
            cert_dir,
        } => {
            writeln!(out)?;
            writeln!(out, "[CLN]")?;
            writeln!(out, "host = {}", quoted(host))?;
            writeln!(out, "port = {port}")?;
            writeln!(out, "rootCert = {}", quoted(cert_dir.join("ca.pem").display()))?;
            writeln!(
                out,
                "privateKey = {}",
                quoted(cert_dir.join("client-key.pem").display())
            )?;
            writeln!(
                out,
                "certChain = {}",
                quoted(cert_dir.join("client.pem").display())
            )?;
        }
    }
    Ok(())
}

/// A TOML basic string holding `value`.
fn quoted(value: impl std::fmt::Display) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for c in raw.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
