use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;

/// A single remote target: host name with optional port and login user.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct HostSpec {
    host: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    user: Option<String>,
}

impl HostSpec {
    /// Creates a new target with no port and no user
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            user: None,
        }
    }
    /// Sets the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
    /// Sets the login user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
    /// Host name
    pub fn host(&self) -> &str {
        &self.host
    }
    /// Port, if any
    pub fn port(&self) -> Option<u16> {
        self.port
    }
    /// Login user, if any
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }
    /// Fills in the user when none is set
    pub(crate) fn or_user(mut self, user: Option<&str>) -> Self {
        if self.user.is_none() {
            self.user = user.map(ToOwned::to_owned);
        }
        self
    }
    /// Display form `user@host:port`. The user part is omitted when it equals
    /// the default user, the port part when no port is set.
    pub fn display_name(&self, default_user: Option<&str>) -> String {
        let mut name = String::new();
        if let Some(user) = self.user.as_deref() {
            if Some(user) != default_user {
                name.push_str(user);
                name.push('@');
            }
        }
        name.push_str(&self.host);
        if let Some(port) = self.port {
            name.push(':');
            name.push_str(&port.to_string());
        }
        name
    }
    /// Parses a `[user@]host[:port]` entry
    pub fn parse(entry: &str) -> Result<Self> {
        let mut user = None;
        let mut rest = entry;
        if let Some((u, h)) = rest.split_once('@') {
            user = Some(u.to_owned());
            rest = h;
        }
        let mut port = None;
        if let Some((h, p)) = rest.rsplit_once(':') {
            port = Some(p.parse::<u16>().map_err(|_| {
                crate::Error::invalid_data(format!("invalid port in host entry: {}", entry))
            })?);
            rest = h;
        }
        if rest.is_empty() {
            return Err(crate::Error::invalid_data(format!(
                "empty host in entry: {}",
                entry
            )));
        }
        Ok(Self {
            host: rest.to_owned(),
            port,
            user,
        })
    }
}

impl From<&str> for HostSpec {
    fn from(entry: &str) -> Self {
        HostSpec::parse(entry).unwrap_or_else(|e| {
            warn!(%e, "treating the whole entry as a host name");
            HostSpec::new(entry)
        })
    }
}

impl From<String> for HostSpec {
    fn from(entry: String) -> Self {
        HostSpec::from(entry.as_str())
    }
}

impl<S: Into<String>> From<(S, u16)> for HostSpec {
    fn from((host, port): (S, u16)) -> Self {
        HostSpec::new(host).with_port(port)
    }
}

impl<S: Into<String>, U: Into<String>> From<(S, u16, U)> for HostSpec {
    fn from((host, port, user): (S, u16, U)) -> Self {
        HostSpec::new(host).with_port(port).with_user(user)
    }
}

/// Parses one host-file line of the form `[user@]host[:port] [user]`.
///
/// Returns `None` for malformed lines (reported with a warning).
fn parse_host_entry(line: &str, default_user: Option<&str>) -> Option<HostSpec> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() > 2 {
        warn!(line, "bad host line, format is [user@]host[:port] [user]");
        return None;
    }
    let mut spec = match HostSpec::parse(fields[0]) {
        Ok(spec) => spec,
        Err(e) => {
            warn!(line, %e, "skipping host line");
            return None;
        }
    };
    if fields.len() == 2 {
        if spec.user.is_some() {
            warn!(line, "user specified twice in host line");
            return None;
        }
        spec.user = Some(fields[1].to_owned());
    }
    Some(spec.or_user(default_user))
}

/// Reads a host file with one `[user@]host[:port] [user]` entry per line.
///
/// Blank lines and lines starting with `#` are skipped, malformed lines are
/// reported with a warning and skipped.
pub fn read_host_file(path: impl AsRef<Path>, default_user: Option<&str>) -> Result<Vec<HostSpec>> {
    let content = fs::read_to_string(path.as_ref())?;
    let mut hosts = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(spec) = parse_host_entry(line, default_user) {
            hosts.push(spec);
        }
    }
    Ok(hosts)
}

/// Reads multiple host files, concatenating the results
pub fn read_host_files<P: AsRef<Path>>(
    paths: &[P],
    default_user: Option<&str>,
) -> Result<Vec<HostSpec>> {
    let mut hosts = Vec::new();
    for path in paths {
        hosts.extend(read_host_file(path, default_user)?);
    }
    Ok(hosts)
}

/// Parses a whitespace-delimited string of `[user@]host[:port]` entries
pub fn parse_host_string(hosts: &str, default_user: Option<&str>) -> Vec<HostSpec> {
    hosts
        .split_whitespace()
        .filter_map(|entry| match HostSpec::parse(entry) {
            Ok(spec) => Some(spec.or_user(default_user)),
            Err(e) => {
                warn!(entry, %e, "skipping host entry");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(HostSpec::parse("node1").unwrap(), HostSpec::new("node1"));
        assert_eq!(
            HostSpec::parse("node1:2222").unwrap(),
            HostSpec::new("node1").with_port(2222)
        );
        assert_eq!(
            HostSpec::parse("admin@node1:2222").unwrap(),
            HostSpec::new("node1").with_port(2222).with_user("admin")
        );
        assert_eq!(
            HostSpec::parse("admin@node1").unwrap(),
            HostSpec::new("node1").with_user("admin")
        );
        assert!(HostSpec::parse("node1:nan").is_err());
        assert!(HostSpec::parse("@:").is_err());
    }

    #[test]
    fn test_display_name() {
        let spec = HostSpec::new("node1").with_port(22).with_user("admin");
        assert_eq!(spec.display_name(None), "admin@node1:22");
        assert_eq!(spec.display_name(Some("admin")), "node1:22");
        assert_eq!(HostSpec::new("node1").display_name(Some("admin")), "node1");
    }

    #[test]
    fn test_tuple_conversions() {
        let spec: HostSpec = ("node1", 22).into();
        assert_eq!(spec.port(), Some(22));
        let spec: HostSpec = ("node1", 22, "root").into();
        assert_eq!(spec.user(), Some("root"));
        let spec: HostSpec = "node1:22".into();
        assert_eq!(spec.port(), Some(22));
    }

    #[test]
    fn test_host_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# cluster").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "node1").unwrap();
        writeln!(file, "node2:2022 operator").unwrap();
        writeln!(file, "admin@node3").unwrap();
        writeln!(file, "admin@node4 operator").unwrap();
        writeln!(file, "one two three").unwrap();
        let hosts = read_host_file(file.path(), Some("deploy")).unwrap();
        assert_eq!(
            hosts,
            vec![
                HostSpec::new("node1").with_user("deploy"),
                HostSpec::new("node2").with_port(2022).with_user("operator"),
                HostSpec::new("node3").with_user("admin"),
            ]
        );
    }

    #[test]
    fn test_host_string() {
        let hosts = parse_host_string("node1 admin@node2:22", None);
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[1].user(), Some("admin"));
    }
}
