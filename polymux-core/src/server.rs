//! Multi-loop server: one monoio runtime per worker thread, all accepting on
//! the same port.
use std::{io, net::SocketAddr, sync::Arc, thread::JoinHandle};

use futures_channel::oneshot::{self, Receiver as OReceiver};
use monoio::utils::bind_to_cpu_set;
use tracing::{info, warn};

use crate::{
    config::RuntimeConfig, context::ServerContext, processor::ChannelProcessor,
    runtime::RuntimeWrapper, AnyResult,
};

pub struct Server;

/// Control handle of a running server. Dropping it stops every loop.
pub struct ServerHandle {
    local_addr: SocketAddr,
    loops: Vec<(JoinHandle<()>, Option<OReceiver<()>>)>,
}

impl Server {
    /// Spawns `worker_threads` event loops and returns once each of them is
    /// listening. With port `0` the first loop picks the port and the others
    /// join it.
    pub fn start(runtime: &RuntimeConfig, context: Arc<ServerContext>) -> io::Result<ServerHandle> {
        let cores = if runtime.cpu_affinity {
            std::thread::available_parallelism().ok()
        } else {
            None
        };

        let mut addr = context.config().listener;
        let threads = runtime.worker_threads.max(1);
        let mut handle = ServerHandle {
            local_addr: addr,
            loops: Vec::with_capacity(threads),
        };
        for loop_id in 0..threads {
            let (stop, stop_rx) = oneshot::channel::<()>();
            let (ready_tx, ready_rx) = std::sync::mpsc::channel::<io::Result<SocketAddr>>();
            let runtime_config = runtime.clone();
            let context = context.clone();
            let thread = std::thread::Builder::new()
                .name(format!("polymux-worker-{loop_id}"))
                .spawn(move || {
                    if let Some(cores) = cores {
                        let core = loop_id % cores.get();
                        if let Err(e) = bind_to_cpu_set([core]) {
                            warn!("bind loop {loop_id} to core {core} failed: {e}");
                        }
                    }
                    let mut runtime = match RuntimeWrapper::new(&runtime_config) {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let driver = if runtime.is_legacy() { "legacy" } else { "io_uring" };
                    info!("loop {loop_id} starts on the {driver} driver");
                    runtime.block_on(async move {
                        let processor = ChannelProcessor::new(loop_id, context);
                        let listener = match processor.bind(addr) {
                            Ok(listener) => listener,
                            Err(e) => {
                                let _ = ready_tx.send(Err(e));
                                return;
                            }
                        };
                        let _ = ready_tx.send(listener.local_addr());
                        processor.serve(listener, stop).await;
                    });
                    info!("loop {loop_id} exit");
                })?;

            // on error `handle` is dropped, which stops the loops started so far
            let bound = ready_rx.recv().map_err(|_| {
                io::Error::new(io::ErrorKind::Other, format!("loop {loop_id} exited early"))
            })??;
            if loop_id == 0 {
                addr = bound;
                handle.local_addr = bound;
            }
            handle.loops.push((thread, Some(stop_rx)));
        }
        info!("listening on {} with {threads} loops", handle.local_addr);
        Ok(handle)
    }
}

impl ServerHandle {
    /// The concrete listening address, with the real port when `0` was
    /// configured.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and closes every Session. Use [`ServerHandle::join`]
    /// to wait for the loops to finish.
    pub fn shutdown(&mut self) {
        info!("server shutdown requested");
        for (_, stop) in self.loops.iter_mut() {
            stop.take();
        }
    }

    /// Blocks until every loop has exited.
    pub fn join(mut self) -> AnyResult<()> {
        let mut panicked = 0;
        for (thread, stop) in std::mem::take(&mut self.loops) {
            let name = thread.thread().name().unwrap_or_default().to_string();
            if thread.join().is_err() {
                warn!("{name} panicked");
                panicked += 1;
            }
            drop(stop);
        }
        if panicked > 0 {
            anyhow::bail!("{panicked} event loops panicked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io::{ErrorKind, Read, Write},
        net::{Shutdown, TcpStream},
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use bytes::{Bytes, BytesMut};

    use super::*;
    use crate::{
        action::ChannelAction,
        config::{RuntimeType, ServerConfig},
        handler::{Detection, IoHandler, ProtocolDetector},
        session::SessionContext,
        AnyError,
    };

    static WRITE_FAILURES: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct Echo {
        pending: VecDeque<Bytes>,
        closing: bool,
    }

    impl IoHandler for Echo {
        fn protocol(&self) -> &'static str {
            "echo"
        }

        fn consume(&mut self, input: &mut BytesMut) -> AnyResult<ChannelAction> {
            if input.starts_with(b"PANIC") {
                panic!("asked to");
            }
            self.pending.push_back(input.split().freeze());
            Ok(ChannelAction::KeepOpen)
        }

        fn produce(&mut self, output: &mut VecDeque<Bytes>) -> AnyResult<ChannelAction> {
            output.extend(self.pending.drain(..));
            Ok(ChannelAction::KeepOpen)
        }

        fn handle_closed_input(&mut self) {
            self.pending.push_back(Bytes::from_static(b"bye"));
            self.closing = true;
        }

        fn write_successful(&mut self, _bytes_written: usize) -> ChannelAction {
            if self.closing && self.pending.is_empty() {
                ChannelAction::CloseAll
            } else {
                ChannelAction::KeepOpen
            }
        }
    }

    /// Half-closes its input on the first bytes and never writes.
    struct Quiet;

    impl IoHandler for Quiet {
        fn protocol(&self) -> &'static str {
            "quiet"
        }

        fn consume(&mut self, input: &mut BytesMut) -> AnyResult<ChannelAction> {
            input.clear();
            Ok(ChannelAction::CloseInput)
        }

        fn produce(&mut self, _output: &mut VecDeque<Bytes>) -> AnyResult<ChannelAction> {
            Ok(ChannelAction::CloseInput)
        }
    }

    /// Keeps every byte buffered.
    struct Hoard;

    impl IoHandler for Hoard {
        fn protocol(&self) -> &'static str {
            "hoard"
        }

        fn consume(&mut self, _input: &mut BytesMut) -> AnyResult<ChannelAction> {
            Ok(ChannelAction::KeepOpen)
        }

        fn produce(&mut self, _output: &mut VecDeque<Bytes>) -> AnyResult<ChannelAction> {
            Ok(ChannelAction::KeepOpen)
        }
    }

    /// Fails to produce and asks to stay open anyway.
    struct Broken;

    impl IoHandler for Broken {
        fn protocol(&self) -> &'static str {
            "broken"
        }

        fn consume(&mut self, input: &mut BytesMut) -> AnyResult<ChannelAction> {
            input.clear();
            Ok(ChannelAction::KeepOpen)
        }

        fn produce(&mut self, _output: &mut VecDeque<Bytes>) -> AnyResult<ChannelAction> {
            anyhow::bail!("nothing to send")
        }

        fn write_failed(&mut self, _error: &AnyError) -> ChannelAction {
            WRITE_FAILURES.fetch_add(1, Ordering::SeqCst);
            ChannelAction::KeepOpen
        }
    }

    /// Binds the handler built by `make` to connections opening with `magic`.
    struct MagicDetector {
        magic: &'static [u8],
        make: fn() -> Box<dyn IoHandler>,
    }

    impl ProtocolDetector for MagicDetector {
        fn name(&self) -> &'static str {
            "magic"
        }

        fn supports(&self, _protocols: &[String]) -> bool {
            true
        }

        fn determine_handler(&self, prefix: &[u8], _session: &SessionContext) -> Detection {
            let n = prefix.len().min(self.magic.len());
            if prefix[..n] != self.magic[..n] {
                Detection::NoMatch
            } else if n < self.magic.len() {
                Detection::NeedMoreData
            } else {
                Detection::Matched((self.make)())
            }
        }
    }

    fn start(threads: usize) -> ServerHandle {
        start_with(threads, |_| {})
    }

    fn start_with(threads: usize, tweak: impl FnOnce(&mut ServerConfig)) -> ServerHandle {
        let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        config.worker_pool.capacity = 1;
        config.shutdown_grace_ms = 200;
        tweak(&mut config);
        let mut builder = ServerContext::builder(config).unwrap();
        let detectors: [(&'static [u8], fn() -> Box<dyn IoHandler>); 4] = [
            (b"ECHO", || Box::<Echo>::default()),
            (b"QUIET", || Box::new(Quiet)),
            (b"HOARD", || Box::new(Hoard)),
            (b"BROKEN", || Box::new(Broken)),
        ];
        for (magic, make) in detectors {
            builder.register_detector(Arc::new(MagicDetector { magic, make }));
        }
        let runtime = RuntimeConfig {
            worker_threads: threads,
            runtime_type: RuntimeType::Legacy,
            cpu_affinity: false,
            ..Default::default()
        };
        Server::start(&runtime, builder.build()).unwrap()
    }

    fn connect(handle: &ServerHandle) -> TcpStream {
        let stream = TcpStream::connect(handle.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn read_closed(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 64];
        // a reset is as good as an orderly close here
        matches!(stream.read(&mut buf), Ok(0) | Err(_))
    }

    /// Like `read_closed`, but a read timeout does not count as closed.
    fn closed_by_server(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 64];
        match stream.read(&mut buf) {
            Ok(n) => n == 0,
            Err(e) => !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
        }
    }

    fn assert_echoes(handle: &ServerHandle) {
        let mut client = connect(handle);
        client.write_all(b"ECHO ok").unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ECHO ok");
    }

    #[test]
    fn test_echo_across_fragmented_detection() {
        let handle = start(2);
        assert_ne!(handle.local_addr().port(), 0);

        let mut client = connect(&handle);
        client.write_all(b"EC").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        client.write_all(b"HO hi").unwrap();

        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ECHO hi");

        client.shutdown(Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"bye");

        handle.join_after_shutdown();
    }

    #[test]
    fn test_unrecognized_and_panicking_sessions_are_isolated() {
        let handle = start(1);

        let mut garbage = connect(&handle);
        garbage.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(read_closed(&mut garbage));

        let mut panicking = connect(&handle);
        panicking.write_all(b"ECHO").unwrap();
        let mut echoed = [0u8; 4];
        panicking.read_exact(&mut echoed).unwrap();
        panicking.write_all(b"PANIC").unwrap();
        assert!(read_closed(&mut panicking));

        // the loop still serves new connections
        let mut healthy = connect(&handle);
        healthy.write_all(b"ECHO ok").unwrap();
        let mut buf = [0u8; 7];
        healthy.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ECHO ok");

        handle.join_after_shutdown();
    }

    #[test]
    fn test_silent_half_closed_session_does_not_stall_loop() {
        let handle = start(1);

        let mut quiet = connect(&handle);
        quiet.write_all(b"QUIET").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        // same loop, so a busy quiet session would starve this one
        assert_echoes(&handle);

        handle.join_after_shutdown();
        assert!(read_closed(&mut quiet));
    }

    #[test]
    fn test_input_over_limit_closes_session() {
        let handle = start_with(1, |config| config.session.max_input_bytes = 64);

        let mut hoarder = connect(&handle);
        hoarder.write_all(b"HOARD").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        hoarder.write_all(&[b'x'; 40]).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        hoarder.write_all(&[b'y'; 40]).unwrap();
        assert!(closed_by_server(&mut hoarder));

        assert_echoes(&handle);
        handle.join_after_shutdown();
    }

    #[test]
    fn test_failed_produce_closes_despite_keep_open() {
        let handle = start(1);
        let before = WRITE_FAILURES.load(Ordering::SeqCst);

        let mut broken = connect(&handle);
        broken.write_all(b"BROKEN").unwrap();
        assert!(closed_by_server(&mut broken));
        assert_eq!(WRITE_FAILURES.load(Ordering::SeqCst), before + 1);

        assert_echoes(&handle);
        handle.join_after_shutdown();
    }

    #[test]
    fn test_shutdown_closes_open_sessions() {
        let handle = start(1);
        let mut idle = connect(&handle);
        idle.write_all(b"ECHO").unwrap();
        let mut buf = [0u8; 4];
        idle.read_exact(&mut buf).unwrap();

        handle.join_after_shutdown();
        assert!(read_closed(&mut idle));
    }

    impl ServerHandle {
        fn join_after_shutdown(mut self) {
            self.shutdown();
            self.join().unwrap();
        }
    }
}
