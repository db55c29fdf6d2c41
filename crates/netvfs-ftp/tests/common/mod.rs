//! Common test utilities: a scripted in-process FTP server.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use netvfs_ftp::SessionConfig;

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Knobs for the server's behaviour.
#[derive(Clone, Debug)]
pub struct MockOptions {
    pub features: Vec<&'static str>,
    pub syst: &'static str,
    pub feat_requires_login: bool,
    pub epsv_broken: bool,
    /// Advertise 127.0.0.2 in PASV replies; only 127.0.0.1 is listening.
    pub pasv_bad_ip: bool,
    pub list_delay: Duration,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            features: vec!["EPSV", "SIZE", "MDTM", "UTF8"],
            syst: "215 UNIX Type: L8",
            feat_requires_login: false,
            epsv_broken: false,
            pasv_bad_ip: false,
            list_delay: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug)]
enum Node {
    Dir,
    File(Vec<u8>),
    Link(String),
}

#[derive(Default)]
struct State {
    tree: BTreeMap<String, Node>,
    /// Files RETR refuses and directories LIST refuses.
    unreadable: BTreeSet<String>,
    listed: Vec<String>,
    commands: Vec<String>,
    connections: usize,
}

/// Handle to a running server.
#[derive(Clone)]
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    options: Arc<MockOptions>,
}

impl MockServer {
    /// Server with the default tree:
    ///
    /// ```text
    /// /readme.txt            "read me"
    /// /pub/a.txt             "hello"
    /// /pub/b/c.txt           "nested"
    /// /empty/
    /// /links/current      -> ../pub/b
    /// /links/readme       -> /readme.txt
    /// /links/dangling     -> nowhere
    /// /secret/key.txt        (RETR refused)
    /// /hidden/               (LIST refused)
    /// /hidden/note.txt       "hidden note"
    /// ```
    pub async fn start() -> Self {
        Self::with_options(MockOptions::default()).await
    }

    pub async fn with_options(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Self {
            addr,
            state: Arc::new(Mutex::new(State::default())),
            options: Arc::new(options),
        };
        server.add_dir("/");
        server.add_file("/readme.txt", b"read me");
        server.add_dir("/pub");
        server.add_file("/pub/a.txt", b"hello");
        server.add_dir("/pub/b");
        server.add_file("/pub/b/c.txt", b"nested");
        server.add_dir("/empty");
        server.add_dir("/links");
        server.add_link("/links/current", "../pub/b");
        server.add_link("/links/readme", "/readme.txt");
        server.add_link("/links/dangling", "nowhere");
        server.add_dir("/secret");
        server.add_file("/secret/key.txt", b"top secret");
        server.make_unreadable("/secret/key.txt");
        server.add_dir("/hidden");
        server.add_file("/hidden/note.txt", b"hidden note");
        server.make_unreadable("/hidden");

        let accept = server.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept.state.lock().unwrap().connections += 1;
                let conn = accept.clone();
                tokio::spawn(async move {
                    let _ = conn.serve(stream).await;
                });
            }
        });
        server
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Session config pointing at this server with short timeouts.
    pub fn config(&self) -> SessionConfig {
        let mut config = SessionConfig::new("127.0.0.1");
        config.port = self.addr.port();
        config.connect_timeout_ms = 2_000;
        config.io_timeout_ms = 5_000;
        config
    }

    pub fn add_dir(&self, path: &str) {
        self.state.lock().unwrap().tree.insert(path.to_string(), Node::Dir);
    }

    pub fn add_file(&self, path: &str, contents: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .tree
            .insert(path.to_string(), Node::File(contents.to_vec()));
    }

    pub fn add_link(&self, path: &str, target: &str) {
        self.state
            .lock()
            .unwrap()
            .tree
            .insert(path.to_string(), Node::Link(target.to_string()));
    }

    pub fn make_unreadable(&self, path: &str) {
        self.state.lock().unwrap().unreadable.insert(path.to_string());
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().tree.contains_key(path)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.state.lock().unwrap().tree.get(path), Some(Node::Dir))
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().unwrap().tree.get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Number of LIST commands served for `dir`.
    pub fn list_count(&self, dir: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .listed
            .iter()
            .filter(|d| d.as_str() == dir)
            .count()
    }

    /// Number of LIST commands served in total.
    pub fn total_list_count(&self) -> usize {
        self.state.lock().unwrap().listed.len()
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Number of commands starting with `verb`.
    pub fn count_commands(&self, verb: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .count()
    }

    /// Control connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    async fn serve(&self, stream: TcpStream) -> std::io::Result<()> {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut session = ConnState {
            cwd: "/".to_string(),
            logged_in: false,
            user: None,
            rename_from: None,
            passive: None,
        };
        send(&mut write, "220 mock FTP server ready").await?;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let command = line.trim_end_matches(['\r', '\n']).to_string();
            self.state.lock().unwrap().commands.push(command.clone());
            let (verb, arg) = match command.split_once(' ') {
                Some((v, a)) => (v.to_ascii_uppercase(), a.to_string()),
                None => (command.to_ascii_uppercase(), String::new()),
            };
            if verb == "QUIT" {
                send(&mut write, "221 Goodbye").await?;
                return Ok(());
            }
            self.handle(&mut session, &mut write, &verb, &arg).await?;
        }
    }

    async fn handle(
        &self,
        conn: &mut ConnState,
        w: &mut OwnedWriteHalf,
        verb: &str,
        arg: &str,
    ) -> std::io::Result<()> {
        let opts = self.options.clone();
        let needs_login = !matches!(verb, "USER" | "PASS" | "FEAT" | "SYST");
        if needs_login && !conn.logged_in {
            return send(w, "530 Please login with USER and PASS").await;
        }
        match verb {
            "USER" => {
                conn.user = Some(arg.to_string());
                if arg == "account" {
                    send(w, "332 Need account for login").await
                } else {
                    send(w, "331 Please specify the password").await
                }
            }
            "PASS" => {
                if arg == "wrong" || conn.user.is_none() {
                    send(w, "530 Login incorrect").await
                } else {
                    conn.logged_in = true;
                    send(w, "230 Login successful").await
                }
            }
            "FEAT" => {
                if opts.feat_requires_login && !conn.logged_in {
                    return send(w, "530 Please login with USER and PASS").await;
                }
                if opts.features.is_empty() {
                    return send(w, "211 No features").await;
                }
                let mut reply = String::from("211-Features:\r\n");
                for f in &opts.features {
                    reply.push_str(&format!(" {f}\r\n"));
                }
                reply.push_str("211 End");
                send(w, &reply).await
            }
            "SYST" => send(w, opts.syst).await,
            "TYPE" => send(w, "200 Switching to Binary mode").await,
            "OPTS" => send(w, "200 Always in UTF8 mode").await,
            "PWD" => send(w, &format!("257 \"{}\" is the current directory", conn.cwd)).await,
            "CWD" => {
                let path = conn.resolve(arg);
                if self.is_dir(&path) {
                    conn.cwd = path;
                    send(w, "250 Directory successfully changed").await
                } else {
                    send(w, "550 Failed to change directory").await
                }
            }
            "EPSV" => {
                if opts.epsv_broken {
                    return send(w, "500 Unknown command").await;
                }
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                conn.passive = Some(listener);
                send(w, &format!("229 Entering Extended Passive Mode (|||{port}|)")).await
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                conn.passive = Some(listener);
                let host = if opts.pasv_bad_ip { "127,0,0,2" } else { "127,0,0,1" };
                send(
                    w,
                    &format!("227 Entering Passive Mode ({host},{},{})", port >> 8, port & 0xff),
                )
                .await
            }
            "LIST" => {
                let dir = conn.cwd.clone();
                let Some(listener) = conn.passive.take() else {
                    return send(w, "425 Use PASV or EPSV first").await;
                };
                if self.state.lock().unwrap().unreadable.contains(&dir) {
                    return send(w, "550 Permission denied").await;
                }
                let mut data = accept(listener).await?;
                self.state.lock().unwrap().listed.push(dir.clone());
                send(w, "150 Here comes the directory listing").await?;
                if !opts.list_delay.is_zero() {
                    tokio::time::sleep(opts.list_delay).await;
                }
                data.write_all(self.listing(&dir).as_bytes()).await?;
                data.shutdown().await?;
                drop(data);
                send(w, "226 Directory send OK").await
            }
            "RETR" => {
                let path = conn.resolve(arg);
                let listener = conn.passive.take();
                let contents = {
                    let state = self.state.lock().unwrap();
                    match state.tree.get(&path) {
                        Some(Node::File(data)) if !state.unreadable.contains(&path) => Some(data.clone()),
                        _ => None,
                    }
                };
                let (Some(contents), Some(listener)) = (contents, listener) else {
                    return send(w, "550 Failed to open file").await;
                };
                let mut data = accept(listener).await?;
                send(
                    w,
                    &format!("150 Opening BINARY mode data connection ({} bytes)", contents.len()),
                )
                .await?;
                data.write_all(&contents).await?;
                data.shutdown().await?;
                drop(data);
                send(w, "226 Transfer complete").await
            }
            "STOR" | "APPE" => {
                let path = conn.resolve(arg);
                let Some(listener) = conn.passive.take() else {
                    return send(w, "425 Use PASV or EPSV first").await;
                };
                if !self.is_dir(&parent_of(&path)) || self.is_dir(&path) {
                    return send(w, "553 Could not create file").await;
                }
                let mut data = accept(listener).await?;
                send(w, "150 Ok to send data").await?;
                let mut received = Vec::new();
                data.read_to_end(&mut received).await?;
                {
                    let mut state = self.state.lock().unwrap();
                    let entry = state.tree.entry(path).or_insert(Node::File(Vec::new()));
                    match entry {
                        Node::File(existing) if verb == "APPE" => existing.extend_from_slice(&received),
                        other => *other = Node::File(received),
                    }
                }
                send(w, "226 Transfer complete").await
            }
            "SIZE" => {
                let path = conn.resolve(arg);
                let size = match self.state.lock().unwrap().tree.get(&path) {
                    Some(Node::File(data)) => Some(data.len()),
                    _ => None,
                };
                match size {
                    Some(n) => send(w, &format!("213 {n}")).await,
                    None => send(w, "550 Could not get file size").await,
                }
            }
            "DELE" => {
                let path = conn.resolve(arg);
                let removed = {
                    let mut state = self.state.lock().unwrap();
                    match state.tree.get(&path) {
                        Some(Node::File(_)) | Some(Node::Link(_)) => state.tree.remove(&path).is_some(),
                        _ => false,
                    }
                };
                if removed {
                    send(w, "250 Delete operation successful").await
                } else {
                    send(w, "550 Delete operation failed").await
                }
            }
            "RMD" => {
                let path = conn.resolve(arg);
                let removed = {
                    let mut state = self.state.lock().unwrap();
                    let prefix = format!("{path}/");
                    let empty = !state.tree.keys().any(|k| k.starts_with(&prefix));
                    if matches!(state.tree.get(&path), Some(Node::Dir)) && empty && path != "/" {
                        state.tree.remove(&path);
                        true
                    } else {
                        false
                    }
                };
                if removed {
                    send(w, "250 Remove directory operation successful").await
                } else {
                    send(w, "550 Remove directory operation failed").await
                }
            }
            "MKD" => {
                let path = conn.resolve(arg);
                let created = {
                    let mut state = self.state.lock().unwrap();
                    let parent_ok = matches!(state.tree.get(&parent_of(&path)), Some(Node::Dir));
                    if parent_ok && !state.tree.contains_key(&path) {
                        state.tree.insert(path.clone(), Node::Dir);
                        true
                    } else {
                        false
                    }
                };
                if created {
                    send(w, &format!("257 \"{path}\" created")).await
                } else {
                    send(w, "550 Create directory operation failed").await
                }
            }
            "RNFR" => {
                let path = conn.resolve(arg);
                if self.exists(&path) {
                    conn.rename_from = Some(path);
                    send(w, "350 Ready for RNTO").await
                } else {
                    send(w, "550 RNFR command failed").await
                }
            }
            "RNTO" => {
                let Some(from) = conn.rename_from.take() else {
                    return send(w, "503 RNFR required first").await;
                };
                let to = conn.resolve(arg);
                let moved = {
                    let mut state = self.state.lock().unwrap();
                    if !matches!(state.tree.get(&parent_of(&to)), Some(Node::Dir)) {
                        false
                    } else {
                        let prefix = format!("{from}/");
                        let keys: Vec<String> = state
                            .tree
                            .keys()
                            .filter(|k| **k == from || k.starts_with(&prefix))
                            .cloned()
                            .collect();
                        for key in keys {
                            if let Some(node) = state.tree.remove(&key) {
                                let renamed = format!("{to}{}", &key[from.len()..]);
                                state.tree.insert(renamed, node);
                            }
                        }
                        true
                    }
                };
                if moved {
                    send(w, "250 Rename successful").await
                } else {
                    send(w, "550 Rename failed").await
                }
            }
            _ => send(w, "502 Command not implemented").await,
        }
    }

    fn listing(&self, dir: &str) -> String {
        let state = self.state.lock().unwrap();
        let prefix = if dir == "/" { "/".to_string() } else { format!("{dir}/") };
        let mut out = format!("total {}\r\n", state.tree.len());
        out.push_str("drwxr-xr-x    2 ftp      ftp          4096 Jan  1  2020 .\r\n");
        out.push_str("drwxr-xr-x    2 ftp      ftp          4096 Jan  1  2020 ..\r\n");
        for (path, node) in state.tree.range(prefix.clone()..) {
            let Some(name) = path.strip_prefix(&prefix) else {
                break;
            };
            if name.is_empty() || name.contains('/') {
                continue;
            }
            let line = match node {
                Node::Dir => format!("drwxr-xr-x    2 ftp      ftp          4096 Jan  1  2020 {name}"),
                Node::File(data) => format!(
                    "-rw-r--r--    1 ftp      ftp      {:>8} Jan  1  2020 {name}",
                    data.len()
                ),
                Node::Link(target) => format!(
                    "lrwxrwxrwx    1 ftp      ftp      {:>8} Jan  1  2020 {name} -> {target}",
                    target.len()
                ),
            };
            out.push_str(&line);
            out.push_str("\r\n");
        }
        out
    }
}

struct ConnState {
    cwd: String,
    logged_in: bool,
    user: Option<String>,
    rename_from: Option<String>,
    passive: Option<TcpListener>,
}

impl ConnState {
    fn resolve(&self, arg: &str) -> String {
        let joined = if arg.starts_with('/') {
            arg.to_string()
        } else if self.cwd == "/" {
            format!("/{arg}")
        } else {
            format!("{}/{arg}", self.cwd)
        };
        let trimmed = joined.trim_end_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

async fn send(w: &mut OwnedWriteHalf, reply: &str) -> std::io::Result<()> {
    w.write_all(reply.as_bytes()).await?;
    w.write_all(b"\r\n").await
}

async fn accept(listener: TcpListener) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(ACCEPT_TIMEOUT, listener.accept()).await {
        Ok(res) => res.map(|(stream, _)| stream),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "no data connection",
        )),
    }
}
