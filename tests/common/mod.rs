//! A tiny HTTP/1.1 server for driving real transfers in tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use resumable_fetch::{DownloadHandle, DownloadManager, HttpProtocol};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// How the server answers a `Range` request when it accepts ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMode {
    /// `206` starting at the requested byte.
    Honour,
    /// Plain `200` with the whole body.
    Ignore,
    /// `206` whose `Content-Range` and body start at byte 0.
    WrongStart,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub body: Vec<u8>,
    pub chunk: usize,
    pub delay: Duration,
    pub accept_ranges: bool,
    /// Send `Accept-Ranges: bytes` on `206` replies too.
    pub advertise_on_partial: bool,
    pub range_mode: RangeMode,
    pub not_found: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            body: (0..100u8).collect(),
            chunk: 20,
            delay: Duration::from_millis(50),
            accept_ranges: true,
            advertise_on_partial: true,
            range_mode: RangeMode::Honour,
            not_found: false,
        }
    }
}

pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    ranges: Arc<Mutex<Vec<Option<usize>>>>,
}

impl TestServer {
    pub async fn start(options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let options = Arc::new(options);

        {
            let requests = Arc::clone(&requests);
            let ranges = Arc::clone(&ranges);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    tokio::spawn(serve(
                        socket,
                        Arc::clone(&options),
                        Arc::clone(&requests),
                        Arc::clone(&ranges),
                    ));
                }
            });
        }

        Self {
            addr,
            requests,
            ranges,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// `Range` start of every request seen so far, `None` for plain GETs.
    pub fn ranges(&self) -> Vec<Option<usize>> {
        self.ranges.lock().unwrap().clone()
    }
}

async fn serve(
    mut socket: TcpStream,
    options: Arc<ServerOptions>,
    requests: Arc<AtomicUsize>,
    ranges: Arc<Mutex<Vec<Option<usize>>>>,
) {
    let _ = socket.set_nodelay(true);
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    requests.fetch_add(1, Ordering::SeqCst);

    let head = String::from_utf8_lossy(&head).into_owned();
    let range_start = head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("range") {
            return None;
        }
        value
            .trim()
            .strip_prefix("bytes=")?
            .strip_suffix('-')?
            .parse::<usize>()
            .ok()
    });
    ranges.lock().unwrap().push(range_start);

    let total = options.body.len();
    let (status, extra, body) = if options.not_found {
        ("404 Not Found", String::new(), &[][..])
    } else {
        match range_start.filter(|_| options.accept_ranges) {
            Some(start) if start >= total => (
                "416 Range Not Satisfiable",
                format!("Content-Range: bytes */{}\r\n", total),
                &[][..],
            ),
            Some(start) => match options.range_mode {
                RangeMode::Honour => (
                    "206 Partial Content",
                    format!("Content-Range: bytes {}-{}/{}\r\n", start, total - 1, total),
                    &options.body[start..],
                ),
                RangeMode::Ignore => ("200 OK", String::new(), &options.body[..]),
                RangeMode::WrongStart => (
                    "206 Partial Content",
                    format!("Content-Range: bytes 0-{}/{}\r\n", total - 1, total),
                    &options.body[..],
                ),
            },
            None => ("200 OK", String::new(), &options.body[..]),
        }
    };
    let advertise =
        options.accept_ranges && (options.advertise_on_partial || !status.starts_with("206"));
    let accept = if advertise { "Accept-Ranges: bytes\r\n" } else { "" };

    let header = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}{}Connection: close\r\n\r\n",
        status,
        body.len(),
        accept,
        extra
    );
    if socket.write_all(header.as_bytes()).await.is_err() {
        return;
    }
    for piece in body.chunks(options.chunk.max(1)) {
        tokio::time::sleep(options.delay).await;
        if socket.write_all(piece).await.is_err() || socket.flush().await.is_err() {
            return;
        }
    }
    let _ = socket.shutdown().await;
}

pub fn manager() -> DownloadManager {
    DownloadManager::builder()
        .register("http", HttpProtocol::default().without_system_proxy())
        .build()
        .unwrap()
}

pub async fn wait_for_bytes(handle: &DownloadHandle, at_least: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.bytes_received() < at_least {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("transfer made no progress");
}
