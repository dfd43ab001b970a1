use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{decode_entry, encode_entry, DirectoryStore, StoreAck, StoreError, StoreKey, StoreResult};
use crate::types::Entry;

/// GETs are spread across this many independent read connections; SETs are
/// funneled through one write connection so writes for the same key stay
/// ordered from this client's point of view.
const GET_CONNECTIONS: usize = 2;

pub struct CraqStoreConfig {
    pub get_addrs: Vec<String>,
    pub set_addr: String,
    /// A request that outlives this surfaces as `StoreError::Timeout` and the
    /// connection is re-opened, instead of stalling the object's resolution
    /// forever.
    pub request_timeout: Duration,
}

impl CraqStoreConfig {
    pub fn new(get_addrs: Vec<String>, set_addr: String) -> Self {
        Self {
            get_addrs,
            set_addr,
            request_timeout: Duration::from_secs(10),
        }
    }
}

enum CraqCommand {
    Get,
    Set { value: String },
}

enum CraqReply {
    Value(String),
    NotFound,
    Stored,
}

struct CraqRequest {
    key: StoreKey,
    command: CraqCommand,
    reply: oneshot::Sender<Result<CraqReply, StoreError>>,
}

/// Client for the chain-replicated store's text protocol.
///
/// Each connection is a task owning one TCP stream and draining one request
/// channel; requests carry a oneshot for the reply, so callers suspend at the
/// await without holding any lock.
pub struct CraqStore {
    get_channels: Vec<flume::Sender<CraqRequest>>,
    set_channel: flume::Sender<CraqRequest>,
    next_get: AtomicUsize,
}

impl CraqStore {
    /// Spawns the connection tasks. Streams are opened lazily on first use
    /// and re-opened after any error, so a store that is down at boot does
    /// not fail construction.
    pub fn new(config: CraqStoreConfig, shutdown: CancellationToken) -> Self {
        let mut get_channels = Vec::with_capacity(GET_CONNECTIONS);
        for slot in 0..GET_CONNECTIONS {
            let addr = config.get_addrs[slot % config.get_addrs.len()].clone();
            let (sender, receiver) = flume::unbounded();
            tokio::spawn(run_connection(
                addr,
                receiver,
                config.request_timeout,
                shutdown.clone(),
            ));
            get_channels.push(sender);
        }

        let (set_sender, set_receiver) = flume::unbounded();
        tokio::spawn(run_connection(
            config.set_addr.clone(),
            set_receiver,
            config.request_timeout,
            shutdown,
        ));

        Self {
            get_channels,
            set_channel: set_sender,
            next_get: AtomicUsize::new(0),
        }
    }

    async fn request(
        &self,
        channel: &flume::Sender<CraqRequest>,
        key: StoreKey,
        command: CraqCommand,
    ) -> Result<CraqReply, StoreError> {
        let (reply_sender, reply_receiver) = oneshot::channel();
        channel
            .send(CraqRequest {
                key,
                command,
                reply: reply_sender,
            })
            .map_err(|_| StoreError::ConnectionClosed)?;
        reply_receiver
            .await
            .map_err(|_| StoreError::ConnectionClosed)?
    }
}

impl DirectoryStore for CraqStore {
    fn get(&self, key: StoreKey) -> BoxFuture<'_, Result<StoreResult, StoreError>> {
        Box::pin(async move {
            let slot = self.next_get.fetch_add(1, Ordering::Relaxed) % self.get_channels.len();
            match self
                .request(&self.get_channels[slot], key, CraqCommand::Get)
                .await?
            {
                CraqReply::Value(raw) => Ok(StoreResult::Found(decode_entry(&raw)?)),
                CraqReply::NotFound => Ok(StoreResult::NotFound),
                CraqReply::Stored => Err(StoreError::Io("unexpected STORED reply to get".into())),
            }
        })
    }

    fn set(
        &self,
        key: StoreKey,
        entry: Entry,
        if_absent: bool,
    ) -> BoxFuture<'_, Result<StoreAck, StoreError>> {
        Box::pin(async move {
            if if_absent {
                // The chain store's protocol has no conditional set. Emulate
                // it with a read on the single set connection: requests on
                // that connection are serialized, so this client cannot race
                // its own write.
                match self
                    .request(&self.set_channel, key.clone(), CraqCommand::Get)
                    .await?
                {
                    CraqReply::Value(_) => return Ok(StoreAck::AlreadyExists),
                    CraqReply::NotFound => {}
                    CraqReply::Stored => {
                        return Err(StoreError::Io("unexpected STORED reply to get".into()))
                    }
                }
            }

            let value = encode_entry(entry);
            match self
                .request(&self.set_channel, key, CraqCommand::Set { value })
                .await?
            {
                CraqReply::Stored => Ok(StoreAck::Stored),
                CraqReply::Value(_) | CraqReply::NotFound => {
                    Err(StoreError::Io("unexpected reply to set".into()))
                }
            }
        })
    }
}

struct CraqConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

async fn open(addr: &str) -> Result<CraqConnection, StoreError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|err| StoreError::Io(format!("connect {addr}: {err}")))?;
    let (read_half, write_half) = stream.into_split();
    debug!("store connection established to {}", addr);
    Ok(CraqConnection {
        reader: BufReader::new(read_half),
        writer: write_half,
    })
}

async fn run_connection(
    addr: String,
    requests: flume::Receiver<CraqRequest>,
    request_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut connection: Option<CraqConnection> = None;

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = requests.recv_async() => match request {
                Ok(request) => request,
                Err(_) => break,
            },
        };

        let reply = match timeout(
            request_timeout,
            serve(&addr, &mut connection, &request),
        )
        .await
        {
            Ok(reply) => reply,
            Err(_) => Err(StoreError::Timeout(request_timeout)),
        };

        if let Err(err) = &reply {
            // Whatever went wrong, the stream state is suspect; re-open on
            // the next request.
            connection = None;
            warn!("store request to {} failed: {}", addr, err);
        }

        // Requester may have given up; nothing to do about that.
        let _ = request.reply.send(reply);
    }
}

async fn serve(
    addr: &str,
    connection: &mut Option<CraqConnection>,
    request: &CraqRequest,
) -> Result<CraqReply, StoreError> {
    let conn = match connection {
        Some(conn) => conn,
        None => connection.insert(open(addr).await?),
    };

    match &request.command {
        CraqCommand::Get => exchange_get(conn, request.key.as_str()).await,
        CraqCommand::Set { value } => exchange_set(conn, request.key.as_str(), value).await,
    }
}

async fn exchange_get(conn: &mut CraqConnection, key: &str) -> Result<CraqReply, StoreError> {
    write_frame(conn, format!("get {key}\r\n")).await?;

    let line = read_reply_line(conn).await?;
    if let Some(rest) = line.strip_prefix("VALUE ") {
        let length: usize = rest
            .split_whitespace()
            .nth(1)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| StoreError::Io(format!("bad VALUE header: {line}")))?;

        let mut payload = vec![0u8; length];
        conn.reader
            .read_exact(&mut payload)
            .await
            .map_err(|err| StoreError::Io(err.to_string()))?;
        let mut crlf = [0u8; 2];
        conn.reader
            .read_exact(&mut crlf)
            .await
            .map_err(|err| StoreError::Io(err.to_string()))?;

        let value = String::from_utf8(payload)
            .map_err(|_| StoreError::MalformedValue("non-utf8 store value".into()))?;
        Ok(CraqReply::Value(value))
    } else if line.starts_with("NOT_FOUND") {
        Ok(CraqReply::NotFound)
    } else {
        Err(StoreError::Io(format!("unexpected reply to get: {line}")))
    }
}

async fn exchange_set(
    conn: &mut CraqConnection,
    key: &str,
    value: &str,
) -> Result<CraqReply, StoreError> {
    write_frame(conn, format!("set {key} {}\r\n{value}\r\n", value.len())).await?;

    let line = read_reply_line(conn).await?;
    if line.starts_with("STORED") {
        Ok(CraqReply::Stored)
    } else {
        Err(StoreError::Io(format!("unexpected reply to set: {line}")))
    }
}

async fn write_frame(conn: &mut CraqConnection, frame: String) -> Result<(), StoreError> {
    conn.writer
        .write_all(frame.as_bytes())
        .await
        .map_err(|err| StoreError::Io(err.to_string()))
}

async fn read_reply_line(conn: &mut CraqConnection) -> Result<String, StoreError> {
    let mut line = String::new();
    let read = conn
        .reader
        .read_line(&mut line)
        .await
        .map_err(|err| StoreError::Io(err.to_string()))?;
    if read == 0 {
        return Err(StoreError::ConnectionClosed);
    }
    Ok(line.trim_end().to_string())
}
