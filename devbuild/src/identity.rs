use log::debug;
use nix::unistd::{getgid, getuid};
use std::process::Command;

use crate::{
    error::{Error, Result},
    services::IdentitySource,
};

/// The user running this process.
pub struct LocalIdentity;

impl IdentitySource for LocalIdentity {
    fn uid_gid(&self) -> Result<(u32, u32)> {
        Ok((getuid().as_raw(), getgid().as_raw()))
    }
}

/// The user at the other end of an SSH destination such as `me@host`.
pub struct SshIdentity {
    pub destination: String,
}

impl IdentitySource for SshIdentity {
    fn uid_gid(&self) -> Result<(u32, u32)> {
        debug!("Asking {} for its uid and gid", self.destination);

        let output = Command::new("ssh")
            .args(["-o", "BatchMode=yes", self.destination.as_str(), "id -u; id -g"])
            .output()?;

        if !output.status.success() {
            return Err(Error::Identity(format!(
                "ssh {} failed ({}): {}",
                self.destination,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_id_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parses the output of `id -u; id -g`.
pub fn parse_id_output(output: &str) -> Result<(u32, u32)> {
    let mut ids = output.split_whitespace().map(|id| {
        id.parse::<u32>()
            .map_err(|_| Error::Identity(format!("not a numeric id: {:?}", id)))
    });

    match (ids.next(), ids.next(), ids.next()) {
        (Some(uid), Some(gid), None) => Ok((uid?, gid?)),
        _ => Err(Error::Identity(format!(
            "expected a uid and a gid, got {:?}",
            output
        ))),
    }
}
