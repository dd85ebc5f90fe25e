//! In-process server stub speaking the crosstalk wire protocol.
//!
//! Accepts connections, validates the header, and echoes request payloads
//! back as response values. Options bend the behavior for failure-path
//! tests: canned remote errors, delayed or reordered responses, a stall
//! after the response head, or responses routed to a bogus call id.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use crosstalk_wire::{self as wire, Identity, Inbound};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Delay before answering each request. Pings are still consumed while
    /// a response is pending.
    pub response_delay: Duration,
    /// Answer every request with this remote error instead of echoing.
    pub fail_with: Option<(String, String)>,
    /// Hold each odd request and answer pairs in reverse arrival order.
    pub reorder_pairs: bool,
    /// Send only the response head, then stall forever.
    pub stall_after_head: bool,
    /// Answer with this call id instead of the request's.
    pub misroute_to_id: Option<i32>,
}

pub struct Server {
    pub addr: String,
    pings: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
    identities: Arc<Mutex<Vec<Option<Identity>>>>,
    _accept_loop: tokio::task::JoinHandle<()>,
}

impl Server {
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn identity_users(&self) -> Vec<Option<String>> {
        self.identities
            .lock()
            .unwrap()
            .iter()
            .map(|id| id.as_ref().map(|id| id.user().to_owned()))
            .collect()
    }
}

static TRACING: Once = Once::new();

/// Route test logs through the test writer; `RUST_LOG` controls the filter.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub async fn start(options: ServerOptions) -> Server {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();

    let pings = Arc::new(AtomicUsize::new(0));
    let connections = Arc::new(AtomicUsize::new(0));
    let identities = Arc::new(Mutex::new(Vec::new()));

    let accept_loop = {
        let pings = pings.clone();
        let connections = connections.clone();
        let identities = identities.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(
                    stream,
                    options.clone(),
                    pings.clone(),
                    identities.clone(),
                ));
            }
        })
    };

    Server {
        addr,
        pings,
        connections,
        identities,
        _accept_loop: accept_loop,
    }
}

async fn serve_connection(
    stream: TcpStream,
    options: ServerOptions,
    pings: Arc<AtomicUsize>,
    identities: Arc<Mutex<Vec<Option<Identity>>>>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));

    let Ok(identity) = wire::read_connection_header(&mut reader).await else {
        return;
    };
    identities.lock().unwrap().push(identity);

    let mut held: Option<(i32, Vec<u8>)> = None;
    loop {
        match wire::read_inbound(&mut reader).await {
            Ok(Inbound::Ping) => {
                pings.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Inbound::Request { call_id, payload }) => {
                if options.reorder_pairs {
                    match held.take() {
                        None => held = Some((call_id, payload)),
                        Some((first_id, first_payload)) => {
                            let mut out = writer.lock().await;
                            if respond(&mut out, &options, call_id, payload).await.is_err() {
                                return;
                            }
                            if respond(&mut out, &options, first_id, first_payload)
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    continue;
                }

                // Answer on a separate task so pings keep being consumed
                // while a delayed response is pending.
                let writer = writer.clone();
                let options = options.clone();
                tokio::spawn(async move {
                    if options.response_delay > Duration::ZERO {
                        tokio::time::sleep(options.response_delay).await;
                    }
                    let mut out = writer.lock().await;
                    let _ = respond(&mut out, &options, call_id, payload).await;
                });
            }
            Err(_) => return,
        }
    }
}

async fn respond(
    out: &mut OwnedWriteHalf,
    options: &ServerOptions,
    call_id: i32,
    payload: Vec<u8>,
) -> io::Result<()> {
    let call_id = options.misroute_to_id.unwrap_or(call_id);

    if options.stall_after_head {
        out.write_all(&call_id.to_be_bytes()).await?;
        out.write_u8(0).await?;
        out.flush().await?;
        std::future::pending::<()>().await;
    }

    let frame = match &options.fail_with {
        Some((class, message)) => wire::error_response_frame(call_id, class, message),
        // The request payload is already in value wire form; echo it.
        None => wire::response_frame(call_id, &payload),
    };
    out.write_all(&frame).await?;
    out.flush().await
}
