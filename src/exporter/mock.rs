//! Test fixtures: canned scrapes and a loopback HTTP responder.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Scrape of a two-core host with two real filesystems and one tmpfs.
pub const TYPICAL_NODE_SCRAPE: &str = r#"
# HELP node_cpu_seconds_total Seconds the CPUs spent in each mode.
# TYPE node_cpu_seconds_total counter
node_cpu_seconds_total{cpu="0",mode="idle"} 10000.5
node_cpu_seconds_total{cpu="0",mode="system"} 500.2
node_cpu_seconds_total{cpu="0",mode="user"} 1500.3
node_cpu_seconds_total{cpu="1",mode="idle"} 9800.1
node_cpu_seconds_total{cpu="1",mode="system"} 600.4
node_cpu_seconds_total{cpu="1",mode="user"} 1700.5
# HELP node_load1 1m load average.
# TYPE node_load1 gauge
node_load1 1.5
node_load5 1.2
node_load15 0.9
node_memory_MemTotal_bytes 17179869184
node_memory_MemAvailable_bytes 8589934592
node_filesystem_size_bytes{device="/dev/sda2",fstype="ext4",mountpoint="/home"} 549755813888
node_filesystem_size_bytes{device="/dev/sda1",fstype="ext4",mountpoint="/"} 274877906944
node_filesystem_size_bytes{device="tmpfs",fstype="tmpfs",mountpoint="/tmp"} 1073741824
node_filesystem_avail_bytes{device="/dev/sda1",fstype="ext4",mountpoint="/"} 137438953472
node_filesystem_avail_bytes{device="/dev/sda2",fstype="ext4",mountpoint="/home"} 274877906944
node_filesystem_avail_bytes{device="tmpfs",fstype="tmpfs",mountpoint="/tmp"} 1073741824
node_hwmon_temp_celsius{chip="nvme",sensor="temp1"} 38.0
node_hwmon_temp_celsius{chip="platform_coretemp_0",sensor="temp1"} 52.04
"#;

/// Minimal HTTP/1.1 responder bound to a random loopback port.
///
/// Every request gets the same canned response. Request bodies are recorded
/// so tests can inspect what was sent.
pub struct TestServer {
    pub url: String,
    hits: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    pub fn start(status: u16, body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let url = format!("http://{}/metrics", listener.local_addr().expect("local addr"));
        let hits = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));

        let body = body.to_string();
        let thread_hits = hits.clone();
        let thread_bodies = bodies.clone();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                thread_hits.fetch_add(1, Ordering::SeqCst);
                respond(stream, status, &body, &thread_bodies);
            }
        });

        Self { url, hits, bodies }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }
}

/// Returns a URL on which nothing is listening.
pub fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}/metrics")
}

/// Reads one request, records its body, then writes the canned response.
fn respond(stream: TcpStream, status: u16, body: &str, bodies: &Mutex<Vec<String>>) -> Option<()> {
    let mut reader = BufReader::new(stream.try_clone().ok()?);
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    let mut request_body = vec![0u8; content_length];
    reader.read_exact(&mut request_body).ok()?;
    bodies
        .lock()
        .unwrap()
        .push(String::from_utf8_lossy(&request_body).into_owned());

    let mut stream = stream;
    let response = format!(
        "HTTP/1.1 {status} Canned\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).ok()?;
    stream.flush().ok()
}
