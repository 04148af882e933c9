//! Framed connection between the plugin and the runtime
//!
//! The runtime socket is multiplexed. Every chunk on the wire starts with
//! an 8 byte header (connection id and payload length, big-endian u32).
//! Connection 1 carries the runtime's requests to the plugin, connection 2
//! the plugin's requests to the runtime. Each connection is a byte stream
//! of ttrpc messages: a 10 byte header (payload length and stream id as
//! big-endian u32, message type, flags) followed by a protobuf request or
//! response envelope. A message may span several chunks.

use super::api::{
    self, code, ConfigureRequest, ConfigureResponse, CreateContainerRequest,
    CreateContainerResponse, Empty, Event, RegisterPluginRequest, StateChangeEvent, Status,
    StopContainerRequest, StopContainerResponse, SynchronizeRequest, SynchronizeResponse,
    TtrpcRequest, TtrpcResponse, UpdateContainerRequest, UpdateContainerResponse,
};
use super::error::{NriError, TransportError};
use super::server::Plugin;
use anyhow::Context;
use prost::Message;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const MESSAGE_HEADER_LENGTH: usize = 10;
pub const MESSAGE_LENGTH_MAX: usize = 4 << 20;
pub const MESSAGE_TYPE_REQUEST: u8 = 0x1;
pub const MESSAGE_TYPE_RESPONSE: u8 = 0x2;

pub const MUX_HEADER_LENGTH: usize = 8;
/// Largest chunk payload, one full ttrpc message
pub const MUX_PAYLOAD_MAX: usize = MESSAGE_HEADER_LENGTH + MESSAGE_LENGTH_MAX;
/// Runtime requests to the plugin and their responses
pub const PLUGIN_SERVICE_CONN: u32 = 1;
/// Plugin requests to the runtime and their responses
pub const RUNTIME_SERVICE_CONN: u32 = 2;

/// One ttrpc message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub kind: u8,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(stream_id: u32, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: MESSAGE_TYPE_REQUEST,
            flags: 0,
            payload,
        }
    }

    pub fn response(stream_id: u32, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: MESSAGE_TYPE_RESPONSE,
            flags: 0,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        if self.payload.len() > MESSAGE_LENGTH_MAX {
            return Err(TransportError::FrameTooLarge {
                size: self.payload.len(),
                limit: MESSAGE_LENGTH_MAX,
            });
        }

        let mut buf = Vec::with_capacity(MESSAGE_HEADER_LENGTH + self.payload.len());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.push(self.kind);
        buf.push(self.flags);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Take one message off the front of `buf`; `None` until it is complete
    pub fn decode(buf: &mut Vec<u8>) -> Result<Option<Self>, TransportError> {
        if buf.len() < MESSAGE_HEADER_LENGTH {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > MESSAGE_LENGTH_MAX {
            return Err(TransportError::FrameTooLarge {
                size: length,
                limit: MESSAGE_LENGTH_MAX,
            });
        }
        if buf.len() < MESSAGE_HEADER_LENGTH + length {
            return Ok(None);
        }

        let rest = buf.split_off(MESSAGE_HEADER_LENGTH + length);
        let message = std::mem::replace(buf, rest);
        Ok(Some(Self {
            stream_id: u32::from_be_bytes([message[4], message[5], message[6], message[7]]),
            kind: message[8],
            flags: message[9],
            payload: message[MESSAGE_HEADER_LENGTH..].to_vec(),
        }))
    }
}

/// Read one chunk as `(conn, payload)`; `None` once the peer closed the socket
pub async fn read_chunk<R>(reader: &mut R) -> Result<Option<(u32, Vec<u8>)>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; MUX_HEADER_LENGTH];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let conn = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if length > MUX_PAYLOAD_MAX {
        return Err(TransportError::FrameTooLarge {
            size: length,
            limit: MUX_PAYLOAD_MAX,
        });
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some((conn, payload)))
}

/// Write `data` to one connection, split into as many chunks as needed
pub async fn write_chunk<W>(writer: &mut W, conn: u32, data: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    for piece in data.chunks(MUX_PAYLOAD_MAX) {
        let mut buf = Vec::with_capacity(MUX_HEADER_LENGTH + piece.len());
        buf.extend_from_slice(&conn.to_be_bytes());
        buf.extend_from_slice(&(piece.len() as u32).to_be_bytes());
        buf.extend_from_slice(piece);
        writer.write_all(&buf).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub async fn write_frame<W>(writer: &mut W, conn: u32, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    write_chunk(writer, conn, &frame.encode()?).await
}

/// Reassembles ttrpc messages per connection from incoming chunks
#[derive(Debug, Default)]
pub struct Demux {
    buffers: HashMap<u32, Vec<u8>>,
}

impl Demux {
    pub fn push(&mut self, conn: u32, data: &[u8]) {
        self.buffers.entry(conn).or_default().extend_from_slice(data);
    }

    pub fn next_frame(&mut self, conn: u32) -> Result<Option<Frame>, TransportError> {
        match self.buffers.get_mut(&conn) {
            Some(buf) => Frame::decode(buf),
            None => Ok(None),
        }
    }
}

/// Connects a [`Plugin`] to the runtime's NRI socket
pub struct Stub<P: Plugin> {
    plugin: Arc<P>,
    plugin_name: String,
    plugin_idx: String,
    socket_path: PathBuf,
}

impl<P: Plugin> Stub<P> {
    pub fn new(
        plugin: Arc<P>,
        plugin_name: impl Into<String>,
        plugin_idx: impl Into<String>,
        socket_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            plugin,
            plugin_name: plugin_name.into(),
            plugin_idx: plugin_idx.into(),
            socket_path: socket_path.into(),
        }
    }

    /// Connect to the runtime and serve until shutdown or disconnect
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", self.socket_path.display()))?;
        info!(socket = %self.socket_path.display(), plugin = %self.plugin_name, "Connected to NRI runtime");

        self.serve(stream, shutdown)
            .await
            .context("NRI connection failed")
    }

    /// Register with the runtime, then answer its requests in arrival order
    pub async fn serve<IO>(
        &self,
        io: IO,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TransportError>
    where
        IO: AsyncRead + AsyncWrite + Send,
    {
        let (mut reader, mut writer) = tokio::io::split(io);
        let result = self.serve_loop(&mut reader, &mut writer, &mut shutdown).await;
        self.plugin.on_close().await;
        result
    }

    async fn serve_loop<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let register = TtrpcRequest {
            service: api::RUNTIME_SERVICE.to_string(),
            method: "RegisterPlugin".to_string(),
            payload: RegisterPluginRequest {
                plugin_name: self.plugin_name.clone(),
                plugin_idx: self.plugin_idx.clone(),
            }
            .encode_to_vec(),
            timeout_nano: 0,
        };
        write_frame(
            writer,
            RUNTIME_SERVICE_CONN,
            &Frame::request(1, register.encode_to_vec()),
        )
        .await?;
        debug!(plugin = %self.plugin_name, idx = %self.plugin_idx, "Sent plugin registration");

        let mut demux = Demux::default();
        loop {
            let chunk = tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, closing NRI connection");
                    return Ok(());
                }
                chunk = read_chunk(reader) => chunk?,
            };

            let Some((conn, data)) = chunk else {
                info!("NRI runtime closed the connection");
                return Ok(());
            };
            if conn != PLUGIN_SERVICE_CONN && conn != RUNTIME_SERVICE_CONN {
                warn!(conn, bytes = data.len(), "Dropping data for unknown NRI connection");
                continue;
            }

            demux.push(conn, &data);
            while let Some(frame) = demux.next_frame(conn)? {
                if conn == RUNTIME_SERVICE_CONN {
                    runtime_response(frame)?;
                } else if self.serve_request(writer, frame).await? {
                    return Ok(());
                }
            }
        }
    }

    /// Answer one runtime request; `true` once the connection should close
    async fn serve_request<W>(&self, writer: &mut W, frame: Frame) -> Result<bool, TransportError>
    where
        W: AsyncWrite + Unpin,
    {
        if frame.kind != MESSAGE_TYPE_REQUEST {
            return Err(TransportError::UnexpectedType(frame.kind));
        }

        let (response, close) = self.dispatch(&frame.payload).await;
        write_frame(
            writer,
            PLUGIN_SERVICE_CONN,
            &Frame::response(frame.stream_id, response.encode_to_vec()),
        )
        .await?;
        Ok(close)
    }

    /// Handle one request; the flag asks the caller to close the connection
    async fn dispatch(&self, payload: &[u8]) -> (TtrpcResponse, bool) {
        let request = match TtrpcRequest::decode(payload) {
            Ok(request) => request,
            Err(e) => return (error_response(code::INVALID_ARGUMENT, e.to_string()), false),
        };

        if request.service != api::PLUGIN_SERVICE {
            return (unimplemented(&request), false);
        }

        let close = request.method == "Shutdown";
        let result = self.handle(&request).await;
        let response = match result {
            Ok(Some(payload)) => TtrpcResponse {
                status: Some(Status {
                    code: code::OK,
                    message: String::new(),
                }),
                payload,
            },
            Ok(None) => unimplemented(&request),
            Err(e) => {
                warn!(method = %request.method, error = %e, "NRI request failed");
                error_response(status_code(&e), e.to_string())
            }
        };
        (response, close)
    }

    /// Encoded response payload, `None` for unknown methods
    async fn handle(&self, request: &TtrpcRequest) -> Result<Option<Vec<u8>>, HandleError> {
        let payload = request.payload.as_slice();
        let plugin = &self.plugin;

        let response = match request.method.as_str() {
            "Configure" => {
                let req = ConfigureRequest::decode(payload)?;
                let mask = plugin
                    .configure(&req.config, &req.runtime_name, &req.runtime_version)
                    .await?;
                ConfigureResponse { events: mask.raw() }.encode_to_vec()
            }
            "Synchronize" => {
                let req = SynchronizeRequest::decode(payload)?;
                let update = plugin.synchronize(req.pods, req.containers).await?;
                SynchronizeResponse { update }.encode_to_vec()
            }
            "Shutdown" => {
                plugin.shutdown().await;
                Empty {}.encode_to_vec()
            }
            "CreateContainer" => {
                let req = CreateContainerRequest::decode(payload)?;
                let (pod, container) = required(req.pod, req.container)?;
                let (adjust, update) = plugin.create_container(&pod, &container).await?;
                CreateContainerResponse {
                    adjust: Some(adjust),
                    update,
                }
                .encode_to_vec()
            }
            "UpdateContainer" => {
                let req = UpdateContainerRequest::decode(payload)?;
                let (pod, container) = required(req.pod, req.container)?;
                let update = plugin
                    .update_container(&pod, &container, req.linux_resources.as_ref())
                    .await?;
                UpdateContainerResponse { update }.encode_to_vec()
            }
            "StopContainer" => {
                let req = StopContainerRequest::decode(payload)?;
                let (pod, container) = required(req.pod, req.container)?;
                let update = plugin.stop_container(&pod, &container).await?;
                StopContainerResponse { update }.encode_to_vec()
            }
            "StateChange" => {
                let req = StateChangeEvent::decode(payload)?;
                self.state_change(req).await?;
                Empty {}.encode_to_vec()
            }
            _ => return Ok(None),
        };

        Ok(Some(response))
    }

    async fn state_change(&self, req: StateChangeEvent) -> Result<(), HandleError> {
        let event = Event::try_from(req.event).unwrap_or(Event::Unknown);
        let pod = req.pod.ok_or(NriError::MissingField("pod"))?;
        let plugin = &self.plugin;

        match event {
            Event::RunPodSandbox => plugin.run_pod_sandbox(&pod).await?,
            Event::StopPodSandbox => plugin.stop_pod_sandbox(&pod).await?,
            Event::RemovePodSandbox => plugin.remove_pod_sandbox(&pod).await?,
            Event::PostCreateContainer
            | Event::StartContainer
            | Event::PostStartContainer
            | Event::PostUpdateContainer
            | Event::RemoveContainer => {
                let container = req.container.ok_or(NriError::MissingField("container"))?;
                match event {
                    Event::PostCreateContainer => plugin.post_create_container(&pod, &container).await?,
                    Event::StartContainer => plugin.start_container(&pod, &container).await?,
                    Event::PostStartContainer => plugin.post_start_container(&pod, &container).await?,
                    Event::PostUpdateContainer => plugin.post_update_container(&pod, &container).await?,
                    _ => plugin.remove_container(&pod, &container).await?,
                }
            }
            other => debug!(event = ?other, "Ignoring state change"),
        }
        Ok(())
    }
}

/// Log the runtime's answer to a plugin request
fn runtime_response(frame: Frame) -> Result<(), TransportError> {
    if frame.kind != MESSAGE_TYPE_RESPONSE {
        return Err(TransportError::UnexpectedType(frame.kind));
    }

    let response = TtrpcResponse::decode(frame.payload.as_slice())?;
    match response.status {
        Some(status) if status.code != code::OK => warn!(
            stream = frame.stream_id,
            code = status.code,
            message = %status.message,
            "Runtime rejected plugin request"
        ),
        _ => debug!(stream = frame.stream_id, "Runtime acknowledged plugin request"),
    }
    Ok(())
}

/// Failure while handling one request
#[derive(Debug, thiserror::Error)]
enum HandleError {
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Plugin(#[from] NriError),
}

fn required(
    pod: Option<api::PodSandbox>,
    container: Option<api::Container>,
) -> Result<(api::PodSandbox, api::Container), NriError> {
    let pod = pod.ok_or(NriError::MissingField("pod"))?;
    let container = container.ok_or(NriError::MissingField("container"))?;
    Ok((pod, container))
}

fn status_code(err: &HandleError) -> i32 {
    match err {
        HandleError::Decode(_)
        | HandleError::Plugin(NriError::MissingField(_))
        | HandleError::Plugin(NriError::UnknownEvent(_))
        | HandleError::Plugin(NriError::InvalidConfig(_)) => code::INVALID_ARGUMENT,
        HandleError::Plugin(_) => code::INTERNAL,
    }
}

fn unimplemented(request: &TtrpcRequest) -> TtrpcResponse {
    error_response(
        code::UNIMPLEMENTED,
        format!("{}/{} is not implemented", request.service, request.method),
    )
}

fn error_response(code: i32, message: String) -> TtrpcResponse {
    TtrpcResponse {
        status: Some(Status { code, message }),
        payload: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nri::api::{Container, ContainerAdjustment, ContainerUpdate, EventMask, PodSandbox};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::io::{duplex, DuplexStream};

    #[derive(Default)]
    struct RecordingPlugin {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingPlugin {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        async fn configure(
            &self,
            config: &str,
            _runtime: &str,
            _version: &str,
        ) -> Result<EventMask, NriError> {
            self.record(format!("configure:{}", config));
            EventMask::parse(&["RunPodSandbox"])
        }

        async fn run_pod_sandbox(&self, pod: &PodSandbox) -> Result<(), NriError> {
            self.record(format!("run:{}", pod.uid));
            Ok(())
        }

        async fn create_container(
            &self,
            _pod: &PodSandbox,
            container: &Container,
        ) -> Result<(ContainerAdjustment, Vec<ContainerUpdate>), NriError> {
            self.record(format!("create:{}", container.id));
            let mut adjust = ContainerAdjustment::default();
            adjust.linux_resources_mut().set_rdt_class("rdt-uid-1");
            Ok((adjust, Vec::new()))
        }

        async fn on_close(&self) {
            self.record("close");
        }
    }

    fn request(method: &str, payload: Vec<u8>) -> Vec<u8> {
        TtrpcRequest {
            service: api::PLUGIN_SERVICE.to_string(),
            method: method.to_string(),
            payload,
            timeout_nano: 0,
        }
        .encode_to_vec()
    }

    /// Read one chunk holding exactly one message
    async fn recv(runtime: &mut DuplexStream, conn: u32) -> Frame {
        let (got, mut data) = read_chunk(runtime).await.unwrap().unwrap();
        assert_eq!(got, conn);
        let frame = Frame::decode(&mut data).unwrap().unwrap();
        assert!(data.is_empty());
        frame
    }

    async fn call(runtime: &mut DuplexStream, stream_id: u32, payload: Vec<u8>) -> TtrpcResponse {
        write_frame(runtime, PLUGIN_SERVICE_CONN, &Frame::request(stream_id, payload))
            .await
            .unwrap();
        let frame = recv(runtime, PLUGIN_SERVICE_CONN).await;
        assert_eq!(frame.kind, MESSAGE_TYPE_RESPONSE);
        assert_eq!(frame.stream_id, stream_id);
        TtrpcResponse::decode(frame.payload.as_slice()).unwrap()
    }

    fn spawn_stub(
        plugin: Arc<RecordingPlugin>,
    ) -> (
        DuplexStream,
        broadcast::Sender<()>,
        tokio::task::JoinHandle<Result<(), TransportError>>,
    ) {
        let (plugin_side, runtime_side) = duplex(64 * 1024);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let stub = Stub::new(plugin, "rdt_agent", "00", "/unused.sock");
        let handle = tokio::spawn(async move { stub.serve(plugin_side, shutdown_rx).await });
        (runtime_side, shutdown_tx, handle)
    }

    /// Spawn a stub on one end of a duplex pipe and consume its registration
    async fn start(
        plugin: Arc<RecordingPlugin>,
    ) -> (
        DuplexStream,
        broadcast::Sender<()>,
        tokio::task::JoinHandle<Result<(), TransportError>>,
    ) {
        let (mut runtime_side, shutdown_tx, handle) = spawn_stub(plugin);

        let frame = recv(&mut runtime_side, RUNTIME_SERVICE_CONN).await;
        assert_eq!(frame.kind, MESSAGE_TYPE_REQUEST);
        let register = TtrpcRequest::decode(frame.payload.as_slice()).unwrap();
        assert_eq!(register.service, api::RUNTIME_SERVICE);
        assert_eq!(register.method, "RegisterPlugin");
        let body = RegisterPluginRequest::decode(register.payload.as_slice()).unwrap();
        assert_eq!(body.plugin_name, "rdt_agent");
        assert_eq!(body.plugin_idx, "00");

        (runtime_side, shutdown_tx, handle)
    }

    fn ok_response() -> Vec<u8> {
        TtrpcResponse {
            status: Some(Status {
                code: code::OK,
                message: String::new(),
            }),
            payload: Vec::new(),
        }
        .encode_to_vec()
    }

    #[test]
    fn test_frame_round_trip() {
        let frame = Frame::request(7, b"hello".to_vec());

        let mut buf = frame.encode().unwrap();
        buf.extend_from_slice(&[0, 0]);
        let read = Frame::decode(&mut buf).unwrap().unwrap();

        assert_eq!(read, frame);
        assert_eq!(buf, vec![0, 0]);
    }

    #[test]
    fn test_frame_header_layout() {
        let buf = Frame::response(3, vec![0xaa, 0xbb]).encode().unwrap();
        assert_eq!(buf, vec![0, 0, 0, 2, 0, 0, 0, 3, 2, 0, 0xaa, 0xbb]);
    }

    #[test]
    fn test_frame_decode_waits_for_whole_message() {
        let mut buf = vec![0, 0, 0, 3, 0, 0, 0, 9, MESSAGE_TYPE_REQUEST];
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0, b'a', b'b']);
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        buf.push(b'c');
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::request(9, b"abc".to_vec()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MESSAGE_LENGTH_MAX as u32) + 1).to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&[MESSAGE_TYPE_REQUEST, 0]);

        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(TransportError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_chunk_header_layout() {
        let mut buf = Vec::new();
        write_chunk(&mut buf, RUNTIME_SERVICE_CONN, &[0xaa, 0xbb, 0xcc])
            .await
            .unwrap();
        assert_eq!(buf, vec![0, 0, 0, 2, 0, 0, 0, 3, 0xaa, 0xbb, 0xcc]);
    }

    #[tokio::test]
    async fn test_large_write_spans_chunks() {
        let mut buf = Vec::new();
        write_chunk(&mut buf, PLUGIN_SERVICE_CONN, &vec![7u8; MUX_PAYLOAD_MAX + 5])
            .await
            .unwrap();

        let mut reader = buf.as_slice();
        let (conn, first) = read_chunk(&mut reader).await.unwrap().unwrap();
        assert_eq!(conn, PLUGIN_SERVICE_CONN);
        assert_eq!(first.len(), MUX_PAYLOAD_MAX);
        let (conn, second) = read_chunk(&mut reader).await.unwrap().unwrap();
        assert_eq!(conn, PLUGIN_SERVICE_CONN);
        assert_eq!(second, vec![7u8; 5]);
        assert!(read_chunk(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunk_split_across_reads() {
        let mut io = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 1, 0, 0])
            .read(&[0, 3])
            .read(b"abc")
            .build();

        let chunk = read_chunk(&mut io).await.unwrap().unwrap();
        assert_eq!(chunk, (PLUGIN_SERVICE_CONN, b"abc".to_vec()));
    }

    #[tokio::test]
    async fn test_truncated_chunk_is_an_error() {
        let mut io = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 1, 0, 0, 0, 8])
            .read(b"abc")
            .build();

        let result = read_chunk(&mut io).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_oversized_chunk_rejected() {
        let mut header = Vec::new();
        header.extend_from_slice(&PLUGIN_SERVICE_CONN.to_be_bytes());
        header.extend_from_slice(&((MUX_PAYLOAD_MAX as u32) + 1).to_be_bytes());

        let result = read_chunk(&mut header.as_slice()).await;
        assert!(matches!(result, Err(TransportError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_eof_reads_as_none() {
        let empty: &[u8] = &[];
        assert!(read_chunk(&mut &*empty).await.unwrap().is_none());
    }

    #[test]
    fn test_demux_keeps_connections_apart() {
        let request = Frame::request(1, b"req".to_vec()).encode().unwrap();
        let response = Frame::response(1, b"resp".to_vec()).encode().unwrap();
        let mut demux = Demux::default();

        demux.push(PLUGIN_SERVICE_CONN, &request[..4]);
        demux.push(RUNTIME_SERVICE_CONN, &response);
        assert!(demux.next_frame(PLUGIN_SERVICE_CONN).unwrap().is_none());
        assert_eq!(
            demux.next_frame(RUNTIME_SERVICE_CONN).unwrap(),
            Some(Frame::response(1, b"resp".to_vec()))
        );

        demux.push(PLUGIN_SERVICE_CONN, &request[4..]);
        assert_eq!(
            demux.next_frame(PLUGIN_SERVICE_CONN).unwrap(),
            Some(Frame::request(1, b"req".to_vec()))
        );
        assert!(demux.next_frame(3).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registration_wire_bytes() {
        let plugin = Arc::new(RecordingPlugin::default());
        let (mut runtime, _shutdown, _handle) = spawn_stub(plugin);

        let mut mux_header = [0u8; MUX_HEADER_LENGTH];
        runtime.read_exact(&mut mux_header).await.unwrap();
        assert_eq!(&mux_header[..4], &[0, 0, 0, 2]);
        let length = u32::from_be_bytes([mux_header[4], mux_header[5], mux_header[6], mux_header[7]]);

        let mut message = vec![0u8; length as usize];
        runtime.read_exact(&mut message).await.unwrap();
        let payload_len = length - MESSAGE_HEADER_LENGTH as u32;
        assert_eq!(&message[..4], &payload_len.to_be_bytes());
        assert_eq!(&message[4..8], &[0, 0, 0, 1]);
        assert_eq!(message[8], MESSAGE_TYPE_REQUEST);
        assert_eq!(message[9], 0);

        let register = TtrpcRequest::decode(&message[MESSAGE_HEADER_LENGTH..]).unwrap();
        assert_eq!(register.service, api::RUNTIME_SERVICE);
        assert_eq!(register.method, "RegisterPlugin");
    }

    #[tokio::test]
    async fn test_request_spanning_chunks_after_registration_ack() {
        let plugin = Arc::new(RecordingPlugin::default());
        let (mut runtime, _shutdown, _handle) = start(plugin.clone()).await;

        write_frame(&mut runtime, RUNTIME_SERVICE_CONN, &Frame::response(1, ok_response()))
            .await
            .unwrap();
        // data for a connection nobody opened is dropped
        write_chunk(&mut runtime, 7, b"noise").await.unwrap();

        let configure = ConfigureRequest {
            config: String::new(),
            runtime_name: "containerd".to_string(),
            runtime_version: "1.7".to_string(),
        };
        let message = Frame::request(5, request("Configure", configure.encode_to_vec()))
            .encode()
            .unwrap();
        let (head, tail) = message.split_at(6);
        write_chunk(&mut runtime, PLUGIN_SERVICE_CONN, head).await.unwrap();
        write_chunk(&mut runtime, PLUGIN_SERVICE_CONN, tail).await.unwrap();

        let mut raw = [0u8; MUX_HEADER_LENGTH + MESSAGE_HEADER_LENGTH];
        runtime.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw[..4], &[0, 0, 0, 1]);
        assert_eq!(&raw[12..16], &[0, 0, 0, 5]);
        assert_eq!(raw[16], MESSAGE_TYPE_RESPONSE);

        let payload_len = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]) as usize;
        let mut payload = vec![0u8; payload_len];
        runtime.read_exact(&mut payload).await.unwrap();
        let response = TtrpcResponse::decode(payload.as_slice()).unwrap();
        assert_eq!(response.status.unwrap().code, code::OK);
        assert_eq!(plugin.calls(), vec!["configure:"]);
    }

    #[tokio::test]
    async fn test_request_on_runtime_connection_is_rejected() {
        let plugin = Arc::new(RecordingPlugin::default());
        let (mut runtime, _shutdown, handle) = start(plugin.clone()).await;

        write_frame(&mut runtime, RUNTIME_SERVICE_CONN, &Frame::request(2, Vec::new()))
            .await
            .unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(TransportError::UnexpectedType(MESSAGE_TYPE_REQUEST))));
        assert_eq!(plugin.calls(), vec!["close"]);
    }

    #[tokio::test]
    async fn test_serves_requests_in_order_until_eof() {
        let plugin = Arc::new(RecordingPlugin::default());
        let (mut runtime, _shutdown, handle) = start(plugin.clone()).await;

        let configure = ConfigureRequest {
            config: "events: [RunPodSandbox]".to_string(),
            runtime_name: "containerd".to_string(),
            runtime_version: "1.7".to_string(),
        };
        let response = call(&mut runtime, 1, request("Configure", configure.encode_to_vec())).await;
        assert_eq!(response.status.unwrap().code, code::OK);
        let body = ConfigureResponse::decode(response.payload.as_slice()).unwrap();
        assert_eq!(body.events, 1);

        let event = StateChangeEvent {
            event: Event::RunPodSandbox as i32,
            pod: Some(PodSandbox {
                uid: "uid-1".to_string(),
                ..Default::default()
            }),
            container: None,
        };
        let response = call(&mut runtime, 3, request("StateChange", event.encode_to_vec())).await;
        assert_eq!(response.status.unwrap().code, code::OK);

        let create = CreateContainerRequest {
            pod: Some(PodSandbox::default()),
            container: Some(Container {
                id: "ctr-1".to_string(),
                ..Default::default()
            }),
        };
        let response = call(&mut runtime, 5, request("CreateContainer", create.encode_to_vec())).await;
        let body = CreateContainerResponse::decode(response.payload.as_slice()).unwrap();
        let rdt_class = body.adjust.unwrap().linux.unwrap().resources.unwrap().rdt_class;
        assert_eq!(rdt_class.unwrap().value, "rdt-uid-1");

        drop(runtime);
        handle.await.unwrap().unwrap();

        assert_eq!(
            plugin.calls(),
            vec![
                "configure:events: [RunPodSandbox]",
                "run:uid-1",
                "create:ctr-1",
                "close"
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let plugin = Arc::new(RecordingPlugin::default());
        let (mut runtime, _shutdown, _handle) = start(plugin).await;

        let response = call(&mut runtime, 1, request("UpdatePodSandbox", Vec::new())).await;
        assert_eq!(response.status.unwrap().code, code::UNIMPLEMENTED);

        let other_service = TtrpcRequest {
            service: "grpc.health.v1.Health".to_string(),
            method: "Check".to_string(),
            payload: Vec::new(),
            timeout_nano: 0,
        };
        let response = call(&mut runtime, 3, other_service.encode_to_vec()).await;
        assert_eq!(response.status.unwrap().code, code::UNIMPLEMENTED);
    }

    #[tokio::test]
    async fn test_missing_container_is_invalid_argument() {
        let plugin = Arc::new(RecordingPlugin::default());
        let (mut runtime, _shutdown, _handle) = start(plugin).await;

        let create = CreateContainerRequest {
            pod: Some(PodSandbox::default()),
            container: None,
        };
        let response = call(&mut runtime, 1, request("CreateContainer", create.encode_to_vec())).await;
        assert_eq!(response.status.unwrap().code, code::INVALID_ARGUMENT);
    }

    #[tokio::test]
    async fn test_shutdown_request_closes() {
        let plugin = Arc::new(RecordingPlugin::default());
        let (mut runtime, _shutdown, handle) = start(plugin.clone()).await;

        let response = call(&mut runtime, 1, request("Shutdown", Vec::new())).await;
        assert_eq!(response.status.unwrap().code, code::OK);

        handle.await.unwrap().unwrap();
        assert_eq!(plugin.calls(), vec!["close"]);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_serving() {
        let plugin = Arc::new(RecordingPlugin::default());
        let (_runtime, shutdown, handle) = start(plugin.clone()).await;

        shutdown.send(()).unwrap();

        handle.await.unwrap().unwrap();
        assert_eq!(plugin.calls(), vec!["close"]);
    }
}
