//! Host entries from the user's OpenSSH client configuration.

use std::path::PathBuf;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SshHost {
    pub name: String,
    pub hostname: String,
    pub user: String,
    pub port: String,
}

/// `~/.ssh/config`, if a home directory is known.
pub fn default_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ssh").join("config"))
}

/// Hosts from the default config file. A missing or unreadable file yields no hosts.
pub fn load() -> Vec<SshHost> {
    default_path()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .map(|content| parse(&content))
        .unwrap_or_default()
}

/// Collect `Host` blocks with their `HostName`, `User` and `Port`. The catch-all `*` block is skipped.
pub fn parse(content: &str) -> Vec<SshHost> {
    fn push(hosts: &mut Vec<SshHost>, host: Option<SshHost>) {
        if let Some(host) = host {
            if !host.name.is_empty() && host.name != "*" {
                hosts.push(host);
            }
        }
    }

    let mut hosts = Vec::new();
    let mut current: Option<SshHost> = None;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let key = match parts.next() {
            Some(key) => key.to_ascii_lowercase(),
            None => continue,
        };
        let value = parts.collect::<Vec<_>>().join(" ");
        if value.is_empty() {
            continue;
        }

        match key.as_str() {
            "host" => {
                push(&mut hosts, current.take());
                current = Some(SshHost {
                    name: value,
                    ..SshHost::default()
                });
            }
            "hostname" => {
                if let Some(host) = current.as_mut() {
                    host.hostname = value;
                }
            }
            "user" => {
                if let Some(host) = current.as_mut() {
                    host.user = value;
                }
            }
            "port" => {
                if let Some(host) = current.as_mut() {
                    host.port = value;
                }
            }
            _ => {}
        }
    }
    push(&mut hosts, current);
    hosts
}
