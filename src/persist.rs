//! Persisted state (spec.md §6): the server key-ring cache file, the
//! pidfile, the measurements log, and the optional service-manager
//! readiness notification.
//!
//! File formats here are deliberately simple line-oriented text, matching
//! the teacher crate's own preference for explicit byte-level encode/decode
//! over a serialization crate where the shape is this narrow.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixDatagram;
use std::path::Path;

use crate::error::{Error, Result};
use crate::ident::IpAddress;
use crate::packet::LeapIndicator;
use crate::timestamp::Seconds;

/// Load `(key id, key material)` pairs from a server key cache file, oldest
/// first (spec.md §4.4, §6). Each line is `<hex-id> <hex-key>`; blank lines
/// and lines starting with `#` are ignored.
///
/// # Errors
/// Returns [`Error::Persistence`] if the file exists but cannot be read or
/// contains a malformed line.
pub fn load_key_cache(path: &Path) -> Result<Vec<(u32, Vec<u8>)>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(_) => return Err(Error::Persistence),
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|_| Error::Persistence)?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let id_hex = parts.next().ok_or(Error::Persistence)?;
        let key_hex = parts.next().ok_or(Error::Persistence)?;
        if parts.next().is_some() {
            return Err(Error::Persistence);
        }
        let id = u32::from_str_radix(id_hex, 16).map_err(|_| Error::Persistence)?;
        let key = decode_hex(key_hex)?;
        entries.push((id, key));
    }
    Ok(entries)
}

/// Persist `(key id, key material)` pairs, oldest first, via a temp file
/// plus rename so a crash mid-write never leaves a truncated cache behind
/// (spec.md §6 "atomic replacement").
///
/// # Errors
/// Returns [`Error::Persistence`] if the temp file cannot be written or
/// renamed into place.
pub fn save_key_cache(path: &Path, entries: &[(u32, Vec<u8>)]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut out = String::new();
    for (id, key) in entries {
        out.push_str(&format!("{id:08x} {}\n", encode_hex(key)));
    }
    fs::write(&tmp_path, out).map_err(|_| Error::Persistence)?;
    fs::rename(&tmp_path, path).map_err(|_| Error::Persistence)?;
    Ok(())
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::Persistence);
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| Error::Persistence))
        .collect()
}

/// Write the running process id to `path` as an ASCII integer plus newline
/// (spec.md §6).
///
/// # Errors
/// Returns [`Error::Persistence`] if the file cannot be created or written.
pub fn write_pidfile(path: &Path, pid: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|_| Error::Persistence)?;
    writeln!(file, "{pid}").map_err(|_| Error::Persistence)
}

/// Remove a pidfile written by [`write_pidfile`]. Not an error if the file
/// is already gone.
///
/// # Errors
/// Returns [`Error::Persistence`] if removal fails for any other reason.
pub fn remove_pidfile(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(_) => Err(Error::Persistence),
    }
}

/// One line of the measurements log: the fields recorded for every accepted
/// sample (spec.md §4.2.3 step 8, §6).
#[derive(Debug, Clone, Copy)]
pub struct MeasurementRecord {
    pub remote: IpAddress,
    pub local: IpAddress,
    pub stratum: u8,
    pub leap: LeapIndicator,
    pub offset: Seconds,
    pub delay: Seconds,
    pub dispersion: Seconds,
    pub root_delay: Seconds,
    pub root_dispersion: Seconds,
}

/// Append-only measurements log: one whitespace-separated line per accepted
/// packet (spec.md §6).
pub struct MeasurementsLog {
    file: File,
}

impl MeasurementsLog {
    /// Open (creating if necessary) the log file for appending.
    ///
    /// # Errors
    /// Returns [`Error::Persistence`] if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|_| Error::Persistence)?;
        Ok(MeasurementsLog { file })
    }

    /// Append one record.
    ///
    /// # Errors
    /// Returns [`Error::Persistence`] if the write fails.
    pub fn record(&mut self, rec: &MeasurementRecord) -> Result<()> {
        writeln!(
            self.file,
            "{} {} {} {:?} {:.9} {:.9} {:.9} {:.9} {:.9}",
            format_ip(rec.remote),
            format_ip(rec.local),
            rec.stratum,
            rec.leap,
            rec.offset.0,
            rec.delay.0,
            rec.dispersion.0,
            rec.root_delay.0,
            rec.root_dispersion.0,
        )
        .map_err(|_| Error::Persistence)
    }
}

fn format_ip(addr: IpAddress) -> String {
    match addr {
        IpAddress::V4(v4) => v4.to_string(),
        IpAddress::V6(v6) => v6.to_string(),
        IpAddress::Unspec => "-".to_string(),
    }
}

/// Tell a supervising service manager the daemon has finished starting up,
/// via the `NOTIFY_SOCKET` datagram protocol, if present in the
/// environment (spec.md §6). A no-op wherever that variable is unset.
pub fn notify_ready() {
    notify("READY=1");
}

/// Tell a supervising service manager the daemon is about to stop
/// (spec.md §6). A no-op wherever `NOTIFY_SOCKET` is unset.
pub fn notify_stopping() {
    notify("STOPPING=1");
}

fn notify(message: &str) {
    let Ok(path) = std::env::var("NOTIFY_SOCKET") else {
        return;
    };
    if path.is_empty() {
        return;
    }
    let Ok(socket) = UnixDatagram::unbound() else {
        return;
    };
    let _ = socket.send_to(message.as_bytes(), &path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn key_cache_round_trips() {
        let dir = std::env::temp_dir().join(format!("ntp-core-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ntskeys");

        let entries = vec![(1u32, vec![0xAB; 8]), (2u32, vec![0xCD; 16])];
        save_key_cache(&path, &entries).unwrap();
        let loaded = load_key_cache(&path).unwrap();
        assert_eq!(loaded, entries);

        fs::remove_file(&path).ok();
        fs::remove_dir(&dir).ok();
    }

    #[test]
    fn missing_key_cache_is_empty_not_an_error() {
        let path = Path::new("/nonexistent/path/that/does/not/exist/ntskeys");
        assert_eq!(load_key_cache(path).unwrap(), Vec::new());
    }

    #[test]
    fn pidfile_round_trips() {
        let dir = std::env::temp_dir().join(format!("ntp-core-test-pid-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ntpd.pid");

        write_pidfile(&path, 4242).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), "4242");

        remove_pidfile(&path).unwrap();
        assert!(!path.exists());
        // removing again is not an error.
        remove_pidfile(&path).unwrap();

        fs::remove_dir(&dir).ok();
    }

    #[test]
    fn measurements_log_appends_one_line_per_record() {
        let dir = std::env::temp_dir().join(format!("ntp-core-test-log-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("measurements.log");

        {
            let mut log = MeasurementsLog::open(&path).unwrap();
            log.record(&MeasurementRecord {
                remote: IpAddress::V4(Ipv4Addr::new(192, 0, 2, 1)),
                local: IpAddress::V4(Ipv4Addr::new(192, 0, 2, 2)),
                stratum: 2,
                leap: LeapIndicator::NoWarning,
                offset: Seconds(0.001),
                delay: Seconds(0.01),
                dispersion: Seconds(0.0001),
                root_delay: Seconds(0.005),
                root_dispersion: Seconds(0.0002),
            })
            .unwrap();
        }
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("192.0.2.1"));

        fs::remove_file(&path).ok();
        fs::remove_dir(&dir).ok();
    }

    #[test]
    fn notify_is_a_silent_no_op_without_the_env_var() {
        std::env::remove_var("NOTIFY_SOCKET");
        notify_ready();
        notify_stopping();
    }
}
