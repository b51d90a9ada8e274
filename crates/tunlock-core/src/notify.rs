//! Notifications
//!
//! Fire-and-forget: a notifier never blocks the loop and never fails it.

use std::net::IpAddr;
use std::process::{Child, Command, Stdio};
use std::thread;
use tracing::{debug, info};

/// Something that can show the user a message
pub trait Notifier: Send {
    fn notify(&self, title: &str, body: &str);
}

/// Kill-switch events worth telling the user about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillSwitchEvent {
    /// Traffic now only flows through `interface`
    Opened {
        interface: String,
        public_address: Option<IpAddr>,
    },
    /// Traffic blocked
    Engaged,
    /// Traffic blocked because the tunnel's fingerprint no longer matches
    Degraded { interface: String, mtu: u32 },
    /// Traffic blocked because it left `interface` from the unprotected address
    Leak {
        interface: String,
        public_address: IpAddr,
    },
}

impl KillSwitchEvent {
    pub fn title(&self) -> &'static str {
        match self {
            KillSwitchEvent::Opened { .. } => "VPN connected",
            KillSwitchEvent::Engaged => "Kill switch engaged",
            KillSwitchEvent::Degraded { .. } => "Kill switch engaged (degraded tunnel)",
            KillSwitchEvent::Leak { .. } => "VPN leak detected",
        }
    }

    pub fn body(&self) -> String {
        match self {
            KillSwitchEvent::Opened {
                interface,
                public_address,
            } => {
                let addr = public_address
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                format!("Traffic allowed through {}. Public IP: {}", interface, addr)
            }
            KillSwitchEvent::Engaged => "VPN not confirmed, all traffic blocked".to_string(),
            KillSwitchEvent::Degraded { interface, mtu } => format!(
                "{} no longer matches the VPN fingerprint (MTU {}), all traffic blocked",
                interface, mtu
            ),
            KillSwitchEvent::Leak {
                interface,
                public_address,
            } => format!(
                "Public IP through {} is the unprotected {}, all traffic blocked",
                interface, public_address
            ),
        }
    }

    pub fn send(&self, notifier: &dyn Notifier) {
        notifier.notify(self.title(), &self.body());
    }
}

/// Desktop notifications via `osascript` (macOS) or `notify-send`
pub struct DesktopNotifier;

impl Notifier for DesktopNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!("{}: {}", title, body);

        let mut cmd = desktop_command(title, body);
        let spawned = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(child) => reap_detached(child),
            Err(e) => debug!("Desktop notification failed: {}", e),
        }
    }
}

/// Wait for `child` on a detached thread so the loop never does
fn reap_detached(mut child: Child) {
    let reaper = thread::Builder::new()
        .name("tunlock-notify".into())
        .spawn(move || {
            let _ = child.wait();
        });
    if let Err(e) = reaper {
        debug!("Could not reap notification process: {}", e);
    }
}

#[cfg(target_os = "macos")]
fn desktop_command(title: &str, body: &str) -> Command {
    let script = format!(
        "display notification \"{}\" with title \"{}\"",
        escape_applescript(body),
        escape_applescript(title)
    );
    let mut cmd = Command::new("osascript");
    cmd.args(["-e", &script]);
    cmd
}

#[cfg(not(target_os = "macos"))]
fn desktop_command(title: &str, body: &str) -> Command {
    let mut cmd = Command::new("notify-send");
    cmd.args(["--app-name=tunlock", title, body]);
    cmd
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn escape_applescript(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Notifier used when desktop notifications are disabled
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!("{}: {}", title, body);
    }
}
