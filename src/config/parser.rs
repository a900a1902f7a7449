use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::ast::*;
use super::ConfigError;
use crate::http::{Method, StatusCode};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    StringLit(String),
    Number(u64),
    LBrace,
    RBrace,
    Semi,
}

type Result<T> = std::result::Result<T, ConfigError>;

fn syntax(msg: impl Into<String>) -> ConfigError {
    ConfigError::Syntax(msg.into())
}

pub fn parse_config(input: &str, base_dir: &Path) -> Result<Config> {
    let tokens = tokenize(input)?;
    let mut p = Parser { tokens, pos: 0, base_dir };
    let mut cfg = p.parse_config()?;

    if cfg.servers.is_empty() {
        return Err(ConfigError::Invalid("no servers defined".into()));
    }
    for (i, s) in cfg.servers.iter_mut().enumerate() {
        if s.listen.is_empty() {
            return Err(ConfigError::Invalid(format!("server #{i} missing listen directive")));
        }
        if s.params.root.is_none() {
            s.params.root = Some(base_dir.to_path_buf());
        }
        s.propagate();
    }
    Ok(cfg)
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '{' => { chars.next(); tokens.push(Token::LBrace); }
            '}' => { chars.next(); tokens.push(Token::RBrace); }
            ';' => { chars.next(); tokens.push(Token::Semi); }
            '#' => {
                for ch in chars.by_ref() {
                    if ch == '\n' {
                        break;
                    }
                }
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                let mut terminated = false;
                for ch in chars.by_ref() {
                    if ch == '"' {
                        terminated = true;
                        break;
                    }
                    s.push(ch);
                }
                if !terminated {
                    return Err(syntax("unterminated string literal"));
                }
                tokens.push(Token::StringLit(s));
            }
            c if c.is_ascii_whitespace() => { chars.next(); }
            _ => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_whitespace() || matches!(ch, '{' | '}' | ';' | '"') {
                        break;
                    }
                    s.push(ch);
                    chars.next();
                }
                if s.chars().all(|ch| ch.is_ascii_digit()) {
                    let n = s.parse::<u64>().map_err(|e| syntax(format!("{s}: {e}")))?;
                    tokens.push(Token::Number(n));
                } else {
                    tokens.push(Token::Ident(s));
                }
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    base_dir: &'a Path,
}

impl<'a> Parser<'a> {
    fn parse_config(&mut self) -> Result<Config> {
        let mut servers = Vec::new();
        while let Some(tok) = self.next() {
            match tok {
                Token::Ident(s) if s == "server" => {
                    self.expect(Token::LBrace)?;
                    servers.push(self.parse_server()?);
                }
                tok => return Err(syntax(format!("unexpected token at top-level: {tok:?}"))),
            }
        }
        Ok(Config { servers })
    }

    fn parse_server(&mut self) -> Result<Server> {
        let mut listen = Vec::new();
        let mut server_names = Vec::new();
        let mut params = Parameters::default();
        let mut locations = Vec::new();

        loop {
            match self.next() {
                Some(Token::RBrace) => break,
                Some(Token::Ident(s)) => match s.as_str() {
                    "listen" => listen.push(self.parse_listen()?),
                    "server_name" => server_names.extend(self.words_until_semi()?),
                    "location" => locations.push(self.parse_location()?),
                    _ => self.parse_parameter(&s, &mut params)?,
                },
                Some(tok) => return Err(syntax(format!("unknown directive in server: {tok:?}"))),
                None => return Err(syntax("unexpected EOF in server block")),
            }
        }

        Ok(Server { listen, server_names, params, locations })
    }

    fn parse_location(&mut self) -> Result<Location> {
        let path = self.expect_stringish()?;
        if !path.starts_with('/') {
            return Err(ConfigError::Invalid(format!("location must start with '/': {path}")));
        }
        self.expect(Token::LBrace)?;
        let mut params = Parameters::default();
        let mut locations = Vec::new();

        loop {
            match self.next() {
                Some(Token::RBrace) => break,
                Some(Token::Ident(s)) if s == "location" => locations.push(self.parse_location()?),
                Some(Token::Ident(s)) => self.parse_parameter(&s, &mut params)?,
                Some(tok) => return Err(syntax(format!("unknown directive in location: {tok:?}"))),
                None => return Err(syntax("unexpected EOF in location block")),
            }
        }

        Ok(Location { path, params, locations })
    }

    /// Directives shared by server and location blocks. Consumes through `;`.
    fn parse_parameter(&mut self, name: &str, params: &mut Parameters) -> Result<()> {
        match name {
            "root" => {
                params.root = Some(self.parse_path()?);
                self.expect(Token::Semi)
            }
            "index" => {
                params.index = Some(self.words_until_semi()?);
                Ok(())
            }
            "autoindex" => {
                params.autoindex = Some(self.parse_switch("autoindex")?);
                self.expect(Token::Semi)
            }
            "cgi" => {
                params.cgi = Some(self.parse_switch("cgi")?);
                self.expect(Token::Semi)
            }
            "client_max_body_size" => {
                params.max_body_size = Some(self.parse_size()?);
                self.expect(Token::Semi)
            }
            "error_page" => {
                let mut words = self.words_until_semi()?;
                let path = words.pop().ok_or_else(|| syntax("error_page needs a path"))?;
                if words.is_empty() {
                    return Err(syntax("error_page needs at least one status code"));
                }
                let path = self.resolve_path(&path);
                for code in words {
                    params.error_pages.insert(parse_status(&code)?, path.clone());
                }
                Ok(())
            }
            "return" => {
                let status = parse_status(&self.expect_stringish()?)?;
                let url = match self.peek() {
                    Some(Token::Semi) => None,
                    _ => Some(self.expect_stringish()?),
                };
                if StatusCode::from_u16(status).is_none() {
                    return Err(ConfigError::Invalid(format!("unsupported return status {status}")));
                }
                params.redirect = Some(Redirect { status, url });
                self.expect(Token::Semi)
            }
            "allow_methods" | "deny_methods" => {
                let methods = self
                    .words_until_semi()?
                    .iter()
                    .map(|m| parse_method(m))
                    .collect::<Result<Vec<_>>>()?;
                if name == "allow_methods" {
                    params.allow_methods = Some(methods);
                } else {
                    params.deny_methods = Some(methods);
                }
                Ok(())
            }
            "cgi_extension" => {
                let mut words = self.words_until_semi()?.into_iter();
                let extension = words.next().ok_or_else(|| syntax("cgi_extension needs an extension"))?;
                if !extension.starts_with('.') || extension.len() < 2 {
                    return Err(ConfigError::Invalid(format!("bad cgi extension: {extension}")));
                }
                let interpreter = words.next().map(PathBuf::from);
                params
                    .cgi_extensions
                    .get_or_insert_with(Vec::new)
                    .push(CgiExtension { extension, interpreter });
                Ok(())
            }
            other => Err(syntax(format!("unknown directive: {other}"))),
        }
    }

    /// `[host:]port [default_server]`
    fn parse_listen(&mut self) -> Result<Listen> {
        let mut words = self.words_until_semi()?.into_iter();
        let value = words.next().ok_or_else(|| syntax("listen needs an address"))?;
        let default_server = match words.next().as_deref() {
            None => false,
            Some("default_server") => true,
            Some(other) => return Err(syntax(format!("unexpected in listen: {other}"))),
        };
        if let Some(extra) = words.next() {
            return Err(syntax(format!("unexpected in listen: {extra}")));
        }
        Ok(Listen { addr: parse_listen_addr(&value)?, default_server })
    }

    fn parse_switch(&mut self, directive: &str) -> Result<bool> {
        match self.expect_stringish()?.to_ascii_lowercase().as_str() {
            "on" => Ok(true),
            "off" => Ok(false),
            _ => Err(syntax(format!("{directive} expects on|off"))),
        }
    }

    /// `N`, `NK`, `NM` or `NG`.
    fn parse_size(&mut self) -> Result<u64> {
        let raw = match self.next() {
            Some(Token::Number(n)) => return Ok(n),
            Some(Token::Ident(s)) | Some(Token::StringLit(s)) => s,
            other => return Err(syntax(format!("expected size, got {other:?}"))),
        };
        let unit = raw.chars().last().unwrap_or_default();
        let digits = &raw[..raw.len() - unit.len_utf8()];
        let shift = match unit.to_ascii_uppercase() {
            'K' => 10,
            'M' => 20,
            'G' => 30,
            _ => return Err(syntax(format!("bad size: {raw}"))),
        };
        let n: u64 = digits.parse().map_err(|_| syntax(format!("bad size: {raw}")))?;
        n.checked_mul(1 << shift).ok_or_else(|| ConfigError::Invalid(format!("size too large: {raw}")))
    }

    fn parse_path(&mut self) -> Result<PathBuf> {
        let p = self.expect_stringish()?;
        Ok(self.resolve_path(&p))
    }

    fn resolve_path(&self, p: &str) -> PathBuf {
        let pb = PathBuf::from(p);
        if pb.is_absolute() {
            pb
        } else {
            self.base_dir.join(pb)
        }
    }

    fn words_until_semi(&mut self) -> Result<Vec<String>> {
        let mut words = Vec::new();
        loop {
            match self.next() {
                Some(Token::Semi) => return Ok(words),
                Some(Token::Ident(s)) | Some(Token::StringLit(s)) => words.push(s),
                Some(Token::Number(n)) => words.push(n.to_string()),
                Some(tok) => return Err(syntax(format!("expected ';', got {tok:?}"))),
                None => return Err(syntax("unexpected EOF, expected ';'")),
            }
        }
    }

    // token helpers
    fn peek(&self) -> Option<&Token> { self.tokens.get(self.pos) }
    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() { self.pos += 1; }
        t
    }
    fn expect(&mut self, want: Token) -> Result<()> {
        match self.next() {
            Some(got) if got == want => Ok(()),
            Some(got) => Err(syntax(format!("expected {want:?}, got {got:?}"))),
            None => Err(syntax(format!("expected {want:?}, got EOF"))),
        }
    }
    fn expect_stringish(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(s)) | Some(Token::StringLit(s)) => Ok(s),
            Some(Token::Number(n)) => Ok(n.to_string()),
            other => Err(syntax(format!("expected string, got {other:?}"))),
        }
    }
}

fn parse_listen_addr(value: &str) -> Result<ListenAddr> {
    let (host, port) = match value.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None if value.chars().all(|c| c.is_ascii_digit()) => (DEFAULT_HOST, value),
        None => return Ok(ListenAddr::new(value, DEFAULT_PORT)),
    };
    let host = if host.is_empty() { DEFAULT_HOST } else { host };
    let port: u32 = port
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid listen port: {value}")))?;
    let port = u16::try_from(port)
        .map_err(|_| ConfigError::Invalid(format!("listen port out of range: {value}")))?;
    Ok(ListenAddr::new(host, port))
}

fn parse_status(raw: &str) -> Result<u16> {
    let code: u16 = raw.parse().map_err(|_| syntax(format!("bad status code: {raw}")))?;
    if !(100..=599).contains(&code) {
        return Err(ConfigError::Invalid(format!("status code out of range: {raw}")));
    }
    Ok(code)
}

fn parse_method(raw: &str) -> Result<Method> {
    Method::parse(&raw.to_ascii_uppercase())
        .map_err(|_| ConfigError::Invalid(format!("unsupported method {raw}")))
}

/// Server names declared more than once on the same address.
pub fn duplicate_names(cfg: &Config) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut dups = Vec::new();
    for server in &cfg.servers {
        for listen in &server.listen {
            for name in &server.server_names {
                if !seen.insert((listen.addr.clone(), name.to_ascii_lowercase())) {
                    dups.push(format!("{name} on {}", listen.addr));
                }
            }
        }
    }
    dups
}
