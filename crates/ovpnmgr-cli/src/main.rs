//! # ovpnmgr CLI
//!
//! Terminal frontend for the openvpn supervisor: starts a session, renders
//! lifecycle events, answers credential prompts interactively and turns
//! Ctrl+C into a graceful disconnect.

mod args;

use args::Args;
use clap::Parser;
use console::Style;
use crossbeam_channel::RecvTimeoutError;
use dialoguer::{Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use ovpnmgr::{
    init_logger, ConnectRequest, ErrorCategory, OpenVpnSession, ProcessHelper, ProxySettings,
    SessionConfig, TunnelEvent,
};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Splits a "host:port" proxy argument.
fn parse_host_port(value: &str) -> Result<(String, u16), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("'{}' is not host:port", value))?;
    if host.is_empty() {
        return Err(format!("'{}' has an empty host", value));
    }
    let port = port
        .parse()
        .map_err(|_| format!("'{}' has an invalid port", value))?;
    Ok((host.to_string(), port))
}

fn proxy_from_args(args: &Args) -> Result<ProxySettings, String> {
    if let Some(spec) = &args.http_proxy {
        let (address, port) = parse_host_port(spec)?;
        return Ok(ProxySettings::Http {
            address,
            port,
            username: args.proxy_user.clone(),
            password: args.proxy_pass.clone(),
        });
    }
    if let Some(spec) = &args.socks_proxy {
        let (address, port) = parse_host_port(spec)?;
        return Ok(ProxySettings::Socks { address, port });
    }
    Ok(ProxySettings::None)
}

/// Format accumulated byte counters like "1.2 MiB".
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.level.clone().into());

    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let yellow = Style::new().yellow().bold();
    let dim = Style::new().dim();
    let bold = Style::new().bold();

    eprintln!(
        "{} {}",
        bold.apply_to("OVPNMGR"),
        dim.apply_to(format!("v{}", env!("CARGO_PKG_VERSION"))),
    );

    let proxy = match proxy_from_args(&args) {
        Ok(proxy) => proxy,
        Err(e) => {
            eprintln!("  {} {}", red.apply_to("✗"), e);
            return ExitCode::FAILURE;
        }
    };

    let helper = Arc::new(ProcessHelper::new());
    let session = Arc::new(OpenVpnSession::new(
        SessionConfig {
            openvpn_path: args.openvpn_path.clone(),
            tunables: Default::default(),
        },
        helper,
    ));

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    session.set_events_tx(events_tx);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap(),
    );
    spinner.set_message("Connecting...");
    spinner.enable_steady_tick(Duration::from_millis(80));

    if let Err(e) = session.start_connect(ConnectRequest {
        config_path: args.config.clone(),
        username: args.username.clone(),
        password: args.password.clone(),
        proxy,
    }) {
        spinner.finish_and_clear();
        eprintln!("  {} {}", red.apply_to("✗"), e);
        return ExitCode::FAILURE;
    }

    let ctrlc_session = Arc::clone(&session);
    ctrlc::set_handler(move || {
        ctrlc_session.start_disconnect();
    })
    .ok();

    let mut total_rx: u64 = 0;
    let mut total_tx: u64 = 0;
    let mut startup_failed = false;

    loop {
        let event = match events_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match event {
            TunnelEvent::Connected => {
                spinner.finish_and_clear();
                let adapter = session.connected_adapter_name();
                if adapter.is_empty() {
                    eprintln!("  {} Connected", green.apply_to("✓"));
                } else {
                    eprintln!(
                        "  {} Connected {}",
                        green.apply_to("✓"),
                        dim.apply_to(format!("(adapter: {})", adapter)),
                    );
                }
                eprintln!("    {}", dim.apply_to("Press Ctrl+C to disconnect"));
            }
            TunnelEvent::Reconnecting => {
                eprintln!("  {} Reconnecting...", yellow.apply_to("~"));
            }
            TunnelEvent::Disconnected => {
                spinner.finish_and_clear();
                eprintln!(
                    "  {} Disconnected {}",
                    dim.apply_to("●"),
                    dim.apply_to(format!(
                        "(rx {}, tx {})",
                        format_bytes(total_rx),
                        format_bytes(total_tx)
                    )),
                );
                break;
            }
            TunnelEvent::Error(error) => {
                spinner.finish_and_clear();
                eprintln!("  {} {}", red.apply_to("✗"), error.user_message());
                if error.category() == ErrorCategory::Startup {
                    startup_failed = true;
                }
            }
            TunnelEvent::RequestUsername => {
                spinner.finish_and_clear();
                let username: String = Input::new()
                    .with_prompt("VPN username")
                    .interact_text()
                    .unwrap_or_default();
                let password = Password::new()
                    .with_prompt("VPN password")
                    .interact()
                    .unwrap_or_default();
                session.continue_with_username_and_password(&username, &password);
            }
            TunnelEvent::RequestPassword => {
                spinner.finish_and_clear();
                let password = Password::new()
                    .with_prompt("VPN password")
                    .interact()
                    .unwrap_or_default();
                session.continue_with_password(&password);
            }
            TunnelEvent::Statistics { rx, tx, .. } => {
                total_rx += rx;
                total_tx += tx;
            }
        }
    }

    if startup_failed {
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
