/// Proxy configuration passed through to the openvpn command line.
///
/// `Autodetect` is a caller-side state only: `start_connect` rejects it with
/// a typed error, it never reaches the launcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProxySettings {
    #[default]
    None,
    Http {
        address: String,
        port: u16,
        username: String,
        password: String,
    },
    Socks {
        address: String,
        port: u16,
    },
    Autodetect,
}

impl ProxySettings {
    /// Appends the `--http-proxy` / `--socks-proxy` flags for this setting.
    pub(crate) fn append_args(&self, args: &mut Vec<String>) {
        match self {
            ProxySettings::Http { address, port, .. } => {
                args.push("--http-proxy".to_string());
                args.push(address.clone());
                args.push(port.to_string());
                args.push("auto".to_string());
            }
            ProxySettings::Socks { address, port } => {
                args.push("--socks-proxy".to_string());
                args.push(address.clone());
                args.push(port.to_string());
            }
            ProxySettings::None | ProxySettings::Autodetect => {}
        }
    }

    /// Username to answer an HTTP proxy credential prompt with.
    pub(crate) fn http_username(&self) -> &str {
        match self {
            ProxySettings::Http { username, .. } => username,
            _ => "",
        }
    }

    /// Password to answer an HTTP proxy credential prompt with.
    pub(crate) fn http_password(&self) -> &str {
        match self {
            ProxySettings::Http { password, .. } => password,
            _ => "",
        }
    }
}
