//! Where a path lives. Supplied by the caller on every path-taking call.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Location {
    /// Always this process, whatever it is
    #[default]
    Local,
    /// Database server host (data directory)
    DbHost,
    /// Host holding the backup repository
    BackupHost,
    /// Any other remote host
    RemoteHost,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Location::Local => "local",
            Location::DbHost => "db-host",
            Location::BackupHost => "backup-host",
            Location::RemoteHost => "remote-host",
        })
    }
}
