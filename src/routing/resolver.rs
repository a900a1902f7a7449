use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use tracing::trace;

use super::{Route, RouteQuery, Routing};
use crate::config::{Config, Parameters, Server};
use crate::http::{Method, StatusCode};

/// [`Routing`] over a parsed configuration and the live filesystem.
#[derive(Debug, Clone)]
pub struct ConfigRouter {
    config: Config,
}

impl ConfigRouter {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn lookup(&self, query: &RouteQuery<'_>) -> Option<(&Server, &Parameters)> {
        let server = self.config.find_server(query.listen, query.host)?;
        let params = server
            .find_location(query.path)
            .map(|loc| &loc.params)
            .unwrap_or(&server.params);
        Some((server, params))
    }
}

impl Routing for ConfigRouter {
    fn resolve(&self, query: &RouteQuery<'_>) -> Route {
        let Some((server, params)) = self.lookup(query) else {
            return Route::default().fail(StatusCode::InternalServerError);
        };
        let route = resolve_in(server, params, query);
        trace!(path = query.path, status = route.status.as_u16(), failed = route.failed, "resolved");
        route
    }

    fn resolve_error(&self, query: &RouteQuery<'_>, status: StatusCode) -> Route {
        let Some((server, params)) = self.lookup(query) else {
            return Route::default().fail(status);
        };
        let mut route = base_route(server, params);
        let Some(page) = params.error_pages.get(&status.as_u16()) else {
            return route.fail(status);
        };
        match fs::metadata(page) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return route.fail(StatusCode::Forbidden),
            Err(e) => return route.fail(status_for_io(&e)),
        }
        if !accessible(page, libc::R_OK) {
            return route.fail(StatusCode::Forbidden);
        }
        route.status = status;
        route.root = page.parent().map(Path::to_path_buf).unwrap_or_default();
        route.real_path = page.clone();
        route
    }
}

fn base_route(server: &Server, params: &Parameters) -> Route {
    let mut route = Route::new(server.name(), params.root.clone().unwrap_or_default());
    route.max_body_size = params.max_body_size();
    route
}

fn resolve_in(server: &Server, params: &Parameters, query: &RouteQuery<'_>) -> Route {
    let mut route = base_route(server, params);

    if let Some(redirect) = &params.redirect {
        let status = StatusCode::from_u16(redirect.status).unwrap_or(StatusCode::InternalServerError);
        return match &redirect.url {
            Some(url) => {
                route.status = status;
                route.redirect = true;
                route.redirect_path = Some(url.clone());
                route
            }
            None if status.is_error() => route.fail(status),
            None => {
                route.status = status;
                route.redirect = true;
                route
            }
        };
    }

    if !params.allows(query.method) {
        return route.fail(StatusCode::MethodNotAllowed);
    }

    let Some(target) = safe_join(&route.root, query.path) else {
        return route.fail(StatusCode::Forbidden);
    };
    route.real_path = target.clone();

    let meta = match fs::metadata(&target) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let parent_is_dir = target.parent().map_or(false, Path::is_dir);
            let is_script = file_name(&target).map_or(false, |n| params.cgi_for(n).is_some());
            if query.method == Method::Post && parent_is_dir && !is_script {
                return route;
            }
            return route.fail(StatusCode::NotFound);
        }
        Err(e) => return route.fail(status_for_io(&e)),
    };

    if meta.is_dir() {
        return resolve_dir(route, params, query.method, &target);
    }
    resolve_file(route, params, query.method, &target)
}

fn resolve_dir(mut route: Route, params: &Parameters, method: Method, dir: &Path) -> Route {
    if method == Method::Delete {
        return route.fail(StatusCode::Forbidden);
    }
    let index = params
        .index
        .iter()
        .flatten()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file());

    match (method, index) {
        (Method::Post, Some(index)) if file_name(&index).and_then(|n| params.cgi_for(n)).is_some() => {
            resolve_file(route, params, method, &index)
        }
        (Method::Post, _) => route,
        (_, Some(index)) => resolve_file(route, params, method, &index),
        (_, None) if params.autoindex() => {
            route.autoindex = true;
            route
        }
        (_, None) => route.fail(StatusCode::Forbidden),
    }
}

fn resolve_file(mut route: Route, params: &Parameters, method: Method, file: &Path) -> Route {
    route.real_path = file.to_path_buf();
    if !accessible(file, libc::R_OK) {
        return route.fail(StatusCode::Forbidden);
    }
    if let Some(rule) = file_name(file).and_then(|n| params.cgi_for(n)) {
        if rule.interpreter.is_none() && !accessible(file, libc::X_OK) {
            return route.fail(StatusCode::Forbidden);
        }
        route.cgi = true;
        route.cgi_interpreter = rule.interpreter.clone();
        return route;
    }
    if method == Method::Post {
        return route.fail(StatusCode::Conflict);
    }
    route
}

/// Joins a request path under `root`, refusing anything that would leave it.
fn safe_join(root: &Path, req_path: &str) -> Option<PathBuf> {
    let clean = req_path.trim_start_matches('/');
    let mut out = root.to_path_buf();
    for comp in Path::new(clean).components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Status answering a failed filesystem access.
pub(crate) fn status_for_io(err: &io::Error) -> StatusCode {
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NotFound,
        io::ErrorKind::PermissionDenied => StatusCode::Forbidden,
        _ => StatusCode::InternalServerError,
    }
}

fn accessible(path: &Path, mode: libc::c_int) -> bool {
    match CString::new(path.as_os_str().as_bytes()) {
        Ok(c) => unsafe { libc::access(c.as_ptr(), mode) == 0 },
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::config::parser::parse_config;
    use crate::config::ListenAddr;

    struct Site {
        dir: tempfile::TempDir,
        router: ConfigRouter,
        listen: ListenAddr,
    }

    impl Site {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path();
            fs::create_dir_all(root.join("www/files")).unwrap();
            fs::create_dir_all(root.join("www/cgi-bin")).unwrap();
            fs::create_dir_all(root.join("www/empty")).unwrap();
            fs::create_dir_all(root.join("errors")).unwrap();
            fs::write(root.join("www/index.html"), "<h1>home</h1>").unwrap();
            fs::write(root.join("www/files/a.txt"), "a").unwrap();
            fs::write(root.join("www/cgi-bin/echo.sh"), "#!/bin/sh\necho ok\n").unwrap();
            fs::write(root.join("errors/404.html"), "missing").unwrap();
            let src = format!(
                r#"
                server {{
                    listen 127.0.0.1:8080;
                    root www;
                    index index.html;
                    error_page 404 errors/404.html;
                    error_page 500 errors/nope.html;
                    location /files {{ autoindex on; allow_methods GET POST; }}
                    location /cgi-bin {{ cgi_extension .sh /bin/sh; }}
                    location /old {{ return 301 /files; }}
                }}
                "#
            );
            let config = parse_config(&src, root).unwrap();
            Site { dir, router: ConfigRouter::new(config), listen: ListenAddr::new("127.0.0.1", 8080) }
        }

        fn resolve(&self, method: Method, path: &str) -> Route {
            self.router.resolve(&RouteQuery { listen: &self.listen, method, path, host: "localhost" })
        }

        fn error(&self, status: StatusCode) -> Route {
            let q = RouteQuery { listen: &self.listen, method: Method::Get, path: "/", host: "localhost" };
            self.router.resolve_error(&q, status)
        }
    }

    #[test]
    fn static_files_and_index() {
        let site = Site::new();
        let route = site.resolve(Method::Get, "/");
        assert!(!route.failed);
        assert_eq!(route.status, StatusCode::Ok);
        assert_eq!(route.real_path, site.dir.path().join("www/index.html"));
        assert_eq!(route.server_name, "localhost");

        assert_eq!(site.resolve(Method::Get, "/missing.html").status, StatusCode::NotFound);
        assert_eq!(site.resolve(Method::Get, "/../secret").status, StatusCode::Forbidden);
    }

    #[test]
    fn directories() {
        let site = Site::new();
        let listing = site.resolve(Method::Get, "/files");
        assert!(listing.autoindex && !listing.failed);

        let empty = site.resolve(Method::Get, "/empty");
        assert!(empty.failed);
        assert_eq!(empty.status, StatusCode::Forbidden);

        assert_eq!(site.resolve(Method::Delete, "/files").status, StatusCode::MethodNotAllowed);
        assert_eq!(site.resolve(Method::Delete, "/empty").status, StatusCode::Forbidden);

        let upload = site.resolve(Method::Post, "/files");
        assert!(!upload.failed && !upload.cgi);
        assert_eq!(upload.real_path, site.dir.path().join("www/files"));
    }

    #[test]
    fn post_targets() {
        let site = Site::new();
        let raw = site.resolve(Method::Post, "/files/new.txt");
        assert!(!raw.failed);
        assert_eq!(site.resolve(Method::Post, "/files/a.txt").status, StatusCode::Conflict);
        assert_eq!(site.resolve(Method::Post, "/files/no/such/dir.txt").status, StatusCode::NotFound);
    }

    #[test]
    fn cgi_and_redirects() {
        let site = Site::new();
        let cgi = site.resolve(Method::Post, "/cgi-bin/echo.sh");
        assert!(cgi.cgi && !cgi.failed);
        assert_eq!(cgi.cgi_interpreter, Some(PathBuf::from("/bin/sh")));
        assert_eq!(site.resolve(Method::Get, "/cgi-bin/none.sh").status, StatusCode::NotFound);

        let moved = site.resolve(Method::Get, "/old/x");
        assert!(moved.redirect && !moved.failed);
        assert_eq!(moved.status, StatusCode::MovedPermanently);
        assert_eq!(moved.redirect_path.as_deref(), Some("/files"));
    }

    #[test]
    fn unreadable_file_is_forbidden() {
        let site = Site::new();
        let secret = site.dir.path().join("www/secret.txt");
        fs::write(&secret, "s").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o000)).unwrap();
        // root bypasses permission bits
        if unsafe { libc::geteuid() } != 0 {
            assert_eq!(site.resolve(Method::Get, "/secret.txt").status, StatusCode::Forbidden);
        }
    }

    #[test]
    fn error_pages() {
        let site = Site::new();
        let found = site.error(StatusCode::NotFound);
        assert!(!found.failed);
        assert_eq!(found.status, StatusCode::NotFound);
        assert_eq!(found.real_path, site.dir.path().join("errors/404.html"));

        let missing = site.error(StatusCode::InternalServerError);
        assert!(missing.failed);
        assert_eq!(missing.status, StatusCode::NotFound);

        let unconfigured = site.error(StatusCode::Forbidden);
        assert!(unconfigured.failed);
        assert_eq!(unconfigured.status, StatusCode::Forbidden);
    }
}
