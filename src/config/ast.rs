use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::http::Method;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SERVER_NAME: &str = "localhost";

#[derive(Debug, Clone)]
pub struct Config {
    pub servers: Vec<Server>,
}

impl Config {
    /// Distinct listen addresses in declaration order. An address is
    /// flagged default when any server declares it `default_server`.
    pub fn listen_addrs(&self) -> Vec<(ListenAddr, bool)> {
        let mut out: Vec<(ListenAddr, bool)> = Vec::new();
        for listen in self.servers.iter().flat_map(|s| s.listen.iter()) {
            match out.iter_mut().find(|(addr, _)| *addr == listen.addr) {
                Some(entry) => entry.1 |= listen.default_server,
                None => out.push((listen.addr.clone(), listen.default_server)),
            }
        }
        out
    }

    /// Server block answering `host` on `addr`: a `server_name` match, then
    /// the `default_server`, then the first server bound there.
    pub fn find_server(&self, addr: &ListenAddr, host: &str) -> Option<&Server> {
        let host = host.split(':').next().unwrap_or("");
        let bound: Vec<&Server> = self
            .servers
            .iter()
            .filter(|s| s.listen.iter().any(|l| l.addr == *addr))
            .collect();
        bound
            .iter()
            .find(|s| s.server_names.iter().any(|n| n.eq_ignore_ascii_case(host)))
            .or_else(|| {
                bound
                    .iter()
                    .find(|s| s.listen.iter().any(|l| l.addr == *addr && l.default_server))
            })
            .or_else(|| bound.first())
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
}

impl ListenAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listen {
    pub addr: ListenAddr,
    pub default_server: bool,
}

#[derive(Debug, Clone)]
pub struct Server {
    pub listen: Vec<Listen>,
    pub server_names: Vec<String>,
    pub params: Parameters,
    pub locations: Vec<Location>,
}

impl Server {
    pub fn name(&self) -> &str {
        self.server_names.first().map(String::as_str).unwrap_or(DEFAULT_SERVER_NAME)
    }

    /// Longest location prefix matching `path` on a segment boundary,
    /// descending into nested locations.
    pub fn find_location(&self, path: &str) -> Option<&Location> {
        best_location(&self.locations, path)
    }

    /// Pushes server-level parameters down into every location.
    pub(crate) fn propagate(&mut self) {
        for loc in &mut self.locations {
            loc.inherit(&self.params);
        }
    }
}

fn best_location<'a>(locations: &'a [Location], path: &str) -> Option<&'a Location> {
    let best = locations
        .iter()
        .filter(|loc| prefix_matches(&loc.path, path))
        .max_by_key(|loc| loc.path.len())?;
    best_location(&best.locations, path).or(Some(best))
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" || prefix == path {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

#[derive(Debug, Clone)]
pub struct Location {
    pub path: String,
    pub params: Parameters,
    pub locations: Vec<Location>,
}

impl Location {
    fn inherit(&mut self, parent: &Parameters) {
        self.params = self.params.merged_over(parent);
        for child in &mut self.locations {
            child.inherit(&self.params);
        }
    }
}

/// Directives valid in both server and location blocks. Unset fields fall
/// back to the enclosing block.
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    pub root: Option<PathBuf>,
    pub index: Option<Vec<String>>,
    pub autoindex: Option<bool>,
    /// Zero means unlimited.
    pub max_body_size: Option<u64>,
    pub error_pages: BTreeMap<u16, PathBuf>,
    pub redirect: Option<Redirect>,
    pub allow_methods: Option<Vec<Method>>,
    pub deny_methods: Option<Vec<Method>>,
    pub cgi_extensions: Option<Vec<CgiExtension>>,
    pub cgi: Option<bool>,
}

impl Parameters {
    pub fn merged_over(&self, parent: &Parameters) -> Parameters {
        let mut error_pages = parent.error_pages.clone();
        error_pages.extend(self.error_pages.iter().map(|(k, v)| (*k, v.clone())));
        Parameters {
            root: self.root.clone().or_else(|| parent.root.clone()),
            index: self.index.clone().or_else(|| parent.index.clone()),
            autoindex: self.autoindex.or(parent.autoindex),
            max_body_size: self.max_body_size.or(parent.max_body_size),
            error_pages,
            redirect: self.redirect.clone().or_else(|| parent.redirect.clone()),
            allow_methods: self.allow_methods.clone().or_else(|| parent.allow_methods.clone()),
            deny_methods: self.deny_methods.clone().or_else(|| parent.deny_methods.clone()),
            cgi_extensions: self.cgi_extensions.clone().or_else(|| parent.cgi_extensions.clone()),
            cgi: self.cgi.or(parent.cgi),
        }
    }

    pub fn allows(&self, method: Method) -> bool {
        let allowed = self.allow_methods.as_ref().map_or(true, |m| m.contains(&method));
        let denied = self.deny_methods.as_ref().map_or(false, |m| m.contains(&method));
        allowed && !denied
    }

    pub fn autoindex(&self) -> bool {
        self.autoindex.unwrap_or(false)
    }

    pub fn max_body_size(&self) -> u64 {
        self.max_body_size.unwrap_or(0)
    }

    /// CGI rule for `file_name`, unless `cgi off` applies.
    pub fn cgi_for(&self, file_name: &str) -> Option<&CgiExtension> {
        if self.cgi == Some(false) {
            return None;
        }
        self.cgi_extensions
            .as_ref()?
            .iter()
            .find(|c| file_name.len() > c.extension.len() && file_name.ends_with(&c.extension))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub status: u16,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiExtension {
    /// Includes the leading dot.
    pub extension: String,
    /// Run the script through this program instead of executing it directly.
    pub interpreter: Option<PathBuf>,
}
