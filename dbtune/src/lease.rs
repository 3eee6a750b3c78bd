// src/lease.rs
//
// Best-effort cross-process resource leasing.
//
// Independent tuning trials race for shared resources (ports, mostly) with
// no coordinator. A candidate is won when:
// 1. its probe succeeds (e.g. the port can be bound right now);
// 2. no marker file `<id>.signal` exists yet;
// 3. creating that marker with `create_new` succeeds.
// Losing any check skips to the next candidate. Running out of candidates is
// the only failure.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TuneError};

/// A won resource. Dropping it keeps the marker; call [`release`](Self::release).
#[derive(Debug)]
pub struct ResourceLease {
    id: String,
    marker: PathBuf,
}

pub fn marker_path(marker_dir: &Path, id: &str) -> PathBuf {
    marker_dir.join(format!("{}.signal", id))
}

impl ResourceLease {
    pub fn acquire<I, F>(marker_dir: &Path, candidates: I, mut probe: F) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: ToString,
        F: FnMut(&str) -> bool,
    {
        fs::create_dir_all(marker_dir)?;

        let mut tried = 0;
        for candidate in candidates {
            tried += 1;
            let id = candidate.to_string();

            if !probe(&id) {
                debug!(id = %id, "probe failed; skipping");
                continue;
            }

            let marker = marker_path(marker_dir, &id);
            if marker.exists() {
                debug!(id = %id, "already claimed; skipping");
                continue;
            }

            match OpenOptions::new().write(true).create_new(true).open(&marker) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    info!(id = %id, marker = %marker.display(), "lease acquired");
                    return Ok(Self { id, marker });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(id = %id, "lost marker race; skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(TuneError::NoFreeResource { tried })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    pub fn release(self) -> Result<()> {
        match fs::remove_file(&self.marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether `port` can be bound on every interface right now.
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

/// Lease the first bindable, unclaimed TCP port in `range`.
pub fn acquire_port(marker_dir: &Path, range: RangeInclusive<u16>) -> Result<(u16, ResourceLease)> {
    let lease = ResourceLease::acquire(marker_dir, range, |id| {
        id.parse::<u16>().map(port_is_free).unwrap_or(false)
    })?;
    let port = lease
        .id()
        .parse::<u16>()
        .map_err(|e| TuneError::Environment(format!("leased port id: {}", e)))?;
    Ok((port, lease))
}
