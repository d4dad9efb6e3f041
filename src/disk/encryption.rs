//! LUKS2 container setup
//!
//! Credentials travel over stdin only, so they never show up in argument
//! lists, logs or error messages.

use crate::utils::command::{Executor, Invocation};
use crate::utils::error::Result;
use tracing::info;

/// luksFormat asks for the passphrase twice
pub fn format_invocation(partition: &str, passphrase: Option<&str>) -> Invocation {
    let secret = passphrase.unwrap_or("");
    Invocation::new("cryptsetup")
        .args(["-q", "luksFormat", "--type", "luks2", partition])
        .stdin(format!("{}\n{}\n", secret, secret))
}

pub fn open_invocation(partition: &str, name: &str, passphrase: Option<&str>) -> Invocation {
    Invocation::new("cryptsetup")
        .args(["open", partition, name])
        .stdin(format!("{}\n", passphrase.unwrap_or("")))
}

pub fn close_invocation(name: &str) -> Invocation {
    Invocation::new("cryptsetup").args(["close", name])
}

/// Format a partition as LUKS2. `None` formats with an empty credential.
pub fn luks_format(cmd: &dyn Executor, partition: &str, passphrase: Option<&str>) -> Result<()> {
    info!(
        "Formatting {} as LUKS2 ({})",
        partition,
        if passphrase.is_some() { "passphrase" } else { "empty credential" }
    );
    cmd.execute(&format_invocation(partition, passphrase))?;
    Ok(())
}

/// Open a LUKS container as `/dev/mapper/<name>`
pub fn luks_open(
    cmd: &dyn Executor,
    partition: &str,
    name: &str,
    passphrase: Option<&str>,
) -> Result<String> {
    info!("Opening {} as /dev/mapper/{}", partition, name);
    cmd.execute(&open_invocation(partition, name, passphrase))?;
    Ok(format!("/dev/mapper/{}", name))
}
