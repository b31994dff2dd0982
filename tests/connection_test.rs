use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use rstest::{fixture, rstest};
use stonenet::{
    setup_local_tracing, AppError, Connection, ConnectionConfig, InMessage, MessageHandler,
    OutMessage, Packer, PrefixSuffixPacker, PrefixSuffixUnpacker, ShutdownState,
};
use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

#[fixture]
#[once]
fn setup() {
    let _ = setup_local_tracing("debug");
}

#[derive(Debug, PartialEq)]
enum Event {
    Message(Vec<u8>),
    Buffered(Vec<u8>),
    UnpackError(Vec<u8>),
}

struct Recorder {
    events: mpsc::UnboundedSender<Event>,
    refuse: AtomicBool,
    // a peer that never closes its side on EOF
    stubborn: AtomicBool,
    closes: AtomicUsize,
    sent: AtomicUsize,
    all_sent: AtomicUsize,
}

impl Recorder {
    fn new() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let recorder = Recorder {
            events,
            refuse: AtomicBool::new(false),
            stubborn: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
            all_sent: AtomicUsize::new(0),
        };
        (Arc::new(recorder), rx)
    }
}

impl MessageHandler for Recorder {
    fn on_message(&self, _conn: &Arc<Connection>, msg: &mut InMessage) -> bool {
        if self.refuse.load(Ordering::SeqCst) {
            return false;
        }
        let _ = self.events.send(Event::Message(msg.to_vec()));
        true
    }

    fn on_message_buffered(
        &self,
        _conn: &Arc<Connection>,
        msg: &mut InMessage,
        link_down: bool,
    ) -> bool {
        if link_down {
            return true;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return false;
        }
        let _ = self.events.send(Event::Buffered(msg.to_vec()));
        true
    }

    fn on_unpack_error(&self, _conn: &Arc<Connection>, partial: &[u8]) {
        let _ = self.events.send(Event::UnpackError(partial.to_vec()));
    }

    fn on_recv_error(&self, conn: &Arc<Connection>, _err: &io::Error) {
        if !self.stubborn.load(Ordering::SeqCst) {
            conn.force_shutdown();
        }
    }

    fn on_message_sent(&self, _conn: &Arc<Connection>, _msg: &OutMessage) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }

    fn on_all_sent(&self, _conn: &Arc<Connection>, _msg: &OutMessage) {
        self.all_sent.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self, _conn: &Arc<Connection>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Splits every write into chunks of at most `chunk` bytes.
struct ChunkedWriter<W> {
    inner: W,
    chunk: usize,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ChunkedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let len = buf.len().min(this.chunk);
        Pin::new(&mut this.inner).poll_write(cx, &buf[..len])
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Tracks how many writes are outstanding at once. A write is outstanding
/// from its first `Pending` until it completes.
struct GaugedWriter<W> {
    inner: W,
    pending: bool,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for GaugedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        match (&result, this.pending) {
            (Poll::Pending, false) => {
                this.pending = true;
                let now = this.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                this.max_in_flight.fetch_max(now, Ordering::SeqCst);
            }
            (Poll::Ready(_), true) => {
                this.pending = false;
                this.in_flight.fetch_sub(1, Ordering::SeqCst);
                this.completed.fetch_add(1, Ordering::SeqCst);
            }
            (Poll::Ready(_), false) => {
                this.max_in_flight.fetch_max(1, Ordering::SeqCst);
                this.completed.fetch_add(1, Ordering::SeqCst);
            }
            (Poll::Pending, true) => {}
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn config() -> ConnectionConfig {
    ConnectionConfig {
        safe_send_interval_ms: 10,
        msg_handling_interval_ms: 10,
        graceful_shutdown_timeout_ms: 2000,
        ..Default::default()
    }
}

fn new_conn(id: u64, config: ConnectionConfig) -> (Arc<Connection>, Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
    let (recorder, rx) = Recorder::new();
    let conn = Connection::new(id, config, recorder.clone()).unwrap();
    (conn, recorder, rx)
}

fn start_pair(a: &Arc<Connection>, b: &Arc<Connection>) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (left_reader, left_writer) = tokio::io::split(left);
    let (right_reader, right_writer) = tokio::io::split(right);
    a.start(left_reader, left_writer).unwrap();
    b.start(right_reader, right_writer).unwrap();
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event within 5s")
        .expect("event channel closed")
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

#[rstest]
#[tokio::test]
async fn test_send_and_receive(_setup: ()) {
    let (a, _ra, _a_rx) = new_conn(1, config());
    let (b, _rb, mut b_rx) = new_conn(2, config());
    start_pair(&a, &b);

    a.send(&[b"hel", b"lo"], false).unwrap();
    assert_eq!(next_event(&mut b_rx).await, Event::Message(b"hello".to_vec()));

    // a native message must already carry the framing of the peer
    a.send_native(&[&[0, 5], b"abc"], false).unwrap();
    assert_eq!(next_event(&mut b_rx).await, Event::Message(b"abc".to_vec()));

    // an already packed buffer goes out untouched
    let packed = a.packer().pack(&[b"pre", b"packed"], false).unwrap();
    a.direct_send(packed, false).unwrap();
    assert_eq!(next_event(&mut b_rx).await, Event::Message(b"prepacked".to_vec()));

    b.send(&[b"pong"], false).unwrap();
    wait_until(|| a.statistic().recv_msg_sum == 1).await;
    wait_until(|| a.statistic().send_msg_sum == 3).await;
    let stat = a.statistic();
    assert_eq!(stat.send_byte_sum, 7 + 5 + 11);
    assert_eq!(stat.recv_byte_sum, 4);

    a.force_shutdown();
    b.force_shutdown();
}

#[rstest]
#[tokio::test]
async fn test_queue_before_start_and_overflow(_setup: ()) {
    let cfg = ConnectionConfig {
        max_msg_num: 2,
        ..config()
    };
    let (a, _ra, _a_rx) = new_conn(1, cfg);
    let (b, _rb, mut b_rx) = new_conn(2, config());

    a.send(&[b"one"], false).unwrap();
    a.send(&[b"two"], false).unwrap();
    assert!(matches!(a.send(&[b"three"], false), Err(AppError::QueueFull(2))));
    a.send(&[b"three"], true).unwrap();
    assert_eq!(a.pending_send_msg_num(), 3);

    // nothing drains an unstarted connection
    assert!(matches!(
        a.safe_send(&[b"four"], false).await,
        Err(AppError::QueueFull(2))
    ));

    // empty payloads are accepted and dropped
    a.send(&[], true).unwrap();
    a.send(&[b""], true).unwrap();
    assert_eq!(a.pending_send_msg_num(), 3);

    start_pair(&a, &b);
    for expected in [&b"one"[..], b"two", b"three"] {
        assert_eq!(next_event(&mut b_rx).await, Event::Message(expected.to_vec()));
    }
    wait_until(|| a.pending_send_msg_num() == 0 && !a.is_sending()).await;

    a.force_shutdown();
    b.force_shutdown();
}

#[rstest]
#[tokio::test]
async fn test_safe_send_waits_for_room(_setup: ()) {
    let cfg = ConnectionConfig {
        max_msg_num: 2,
        ..config()
    };
    let (a, _ra, _a_rx) = new_conn(1, cfg);
    let (local, mut peer) = tokio::io::duplex(64);
    let (reader, writer) = tokio::io::split(local);
    a.start(reader, writer).unwrap();

    let payload = |i: u8| vec![i; 100];
    // stalls on the tiny pipe and stays outstanding
    a.send(&[&payload(1)], false).unwrap();
    assert!(a.is_sending());
    a.send(&[&payload(2)], false).unwrap();
    a.send(&[&payload(3)], false).unwrap();
    assert_eq!(a.pending_send_msg_num(), 2);
    assert!(matches!(
        a.send(&[&payload(4)], false),
        Err(AppError::QueueFull(2))
    ));

    let waiter = tokio::spawn({
        let a = a.clone();
        async move { a.safe_send(&[&payload(4)], false).await }
    });
    sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    let mut wire = vec![0u8; 4 * 102];
    timeout(Duration::from_secs(5), peer.read_exact(&mut wire))
        .await
        .expect("peer read timed out")
        .unwrap();
    waiter.await.unwrap().unwrap();

    for (index, frame) in wire.chunks(102).enumerate() {
        assert_eq!(&frame[..2], &[0, 102]);
        assert!(frame[2..].iter().all(|b| *b == index as u8 + 1));
    }

    a.force_shutdown();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_senders_keep_order(_setup: ()) {
    const PRODUCERS: u8 = 8;
    const PER_PRODUCER: u16 = 200;

    let (a, _ra, _a_rx) = new_conn(1, config());
    let (b, _rb, mut b_rx) = new_conn(2, config());
    let (left, right) = tokio::io::duplex(1024);
    let (left_reader, left_writer) = tokio::io::split(left);
    let (right_reader, right_writer) = tokio::io::split(right);
    a.start(
        left_reader,
        ChunkedWriter {
            inner: left_writer,
            chunk: 7,
        },
    )
    .unwrap();
    b.start(right_reader, right_writer).unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let a = a.clone();
            tokio::spawn(async move {
                for seq in 0..PER_PRODUCER {
                    let [hi, lo] = seq.to_be_bytes();
                    a.send(&[&[producer], &[hi, lo]], true).unwrap();
                    if seq % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let total = PRODUCERS as usize * PER_PRODUCER as usize;
    let mut next_seq = vec![0u16; PRODUCERS as usize];
    for _ in 0..total {
        match next_event(&mut b_rx).await {
            Event::Message(body) => {
                assert_eq!(body.len(), 3);
                let producer = body[0] as usize;
                let seq = u16::from_be_bytes([body[1], body[2]]);
                assert_eq!(seq, next_seq[producer], "producer {} out of order", producer);
                next_seq[producer] += 1;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(next_seq.iter().all(|seq| *seq == PER_PRODUCER));

    wait_until(|| a.statistic().send_msg_sum == total as u64).await;
    assert_eq!(a.statistic().send_byte_sum, total as u64 * 5);
    assert_eq!(b.statistic().recv_msg_sum, total as u64);

    a.force_shutdown();
    b.force_shutdown();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_write_in_flight_under_concurrent_senders(_setup: ()) {
    const PRODUCERS: u8 = 8;
    const PER_PRODUCER: u16 = 100;

    let (a, _ra, _a_rx) = new_conn(1, config());
    let (b, _rb, mut b_rx) = new_conn(2, config());
    // a small pipe keeps writes pending while producers keep sending
    let (left, right) = tokio::io::duplex(256);
    let (left_reader, left_writer) = tokio::io::split(left);
    let (right_reader, right_writer) = tokio::io::split(right);
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    a.start(
        left_reader,
        GaugedWriter {
            inner: left_writer,
            pending: false,
            in_flight: in_flight.clone(),
            max_in_flight: max_in_flight.clone(),
            completed: completed.clone(),
        },
    )
    .unwrap();
    b.start(right_reader, right_writer).unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let a = a.clone();
            tokio::spawn(async move {
                for seq in 0..PER_PRODUCER {
                    let [hi, lo] = seq.to_be_bytes();
                    a.send(&[&[producer], &[hi, lo], &[0u8; 32]], true).unwrap();
                    if seq % 8 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let total = PRODUCERS as usize * PER_PRODUCER as usize;
    for _ in 0..total {
        assert!(matches!(next_event(&mut b_rx).await, Event::Message(_)));
    }
    wait_until(|| a.pending_send_msg_num() == 0 && !a.is_sending()).await;

    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    assert!(completed.load(Ordering::SeqCst) > 0);

    a.force_shutdown();
    b.force_shutdown();
}

#[rstest]
#[tokio::test]
async fn test_refused_messages_are_retried_in_order(_setup: ()) {
    let (a, _ra, _a_rx) = new_conn(1, config());
    let (b, rb, mut b_rx) = new_conn(2, config());
    start_pair(&a, &b);

    rb.refuse.store(true, Ordering::SeqCst);
    for msg in [&b"m1"[..], b"m2", b"m3"] {
        a.send(&[msg], false).unwrap();
    }
    wait_until(|| b.backlog_msg_num() == 3).await;
    assert!(b_rx.try_recv().is_err());

    rb.refuse.store(false, Ordering::SeqCst);
    for expected in [&b"m1"[..], b"m2", b"m3"] {
        assert_eq!(next_event(&mut b_rx).await, Event::Buffered(expected.to_vec()));
    }

    // the backlog is empty again, delivery goes back to immediate
    sleep(Duration::from_millis(50)).await;
    a.send(&[b"m4"], false).unwrap();
    assert_eq!(next_event(&mut b_rx).await, Event::Message(b"m4".to_vec()));

    a.force_shutdown();
    b.force_shutdown();
}

#[rstest]
#[tokio::test]
async fn test_suspend_and_resume_dispatch(_setup: ()) {
    let (a, _ra, _a_rx) = new_conn(1, config());
    let (b, _rb, mut b_rx) = new_conn(2, config());
    start_pair(&a, &b);

    b.suspend_dispatch();
    assert!(b.is_dispatch_suspended());
    a.send(&[b"held"], false).unwrap();
    assert_eq!(next_event(&mut b_rx).await, Event::Buffered(b"held".to_vec()));

    b.resume_dispatch();
    assert!(!b.is_dispatch_suspended());
    sleep(Duration::from_millis(50)).await;
    a.send(&[b"direct"], false).unwrap();
    assert_eq!(next_event(&mut b_rx).await, Event::Message(b"direct".to_vec()));

    a.force_shutdown();
    b.force_shutdown();
}

#[rstest]
#[tokio::test]
async fn test_unpack_error_keeps_connection_alive(_setup: ()) {
    let (a, _ra, _a_rx) = new_conn(1, config());
    let (b, _rb, mut b_rx) = new_conn(2, config());
    start_pair(&a, &b);

    // a frame length of 1 is shorter than the header itself
    a.send_native(&[&[0, 1]], false).unwrap();
    assert_eq!(next_event(&mut b_rx).await, Event::UnpackError(vec![0, 1]));

    a.send(&[b"ok"], false).unwrap();
    assert_eq!(next_event(&mut b_rx).await, Event::Message(b"ok".to_vec()));
    assert_eq!(b.shutdown_state(), ShutdownState::Active);
    assert!(b.is_started());

    a.force_shutdown();
    b.force_shutdown();
}

#[rstest]
#[tokio::test]
async fn test_framing_limits(_setup: ()) {
    let cfg = ConnectionConfig {
        msg_buffer_size: 16,
        ..config()
    };
    let (a, _ra, _a_rx) = new_conn(1, cfg);

    assert!(matches!(
        a.send(&[&[0u8; 20]], false),
        Err(AppError::FramingOverflow(_))
    ));
    a.send(&[&[0u8; 14]], false).unwrap();
    assert_eq!(a.pending_send_msg_num(), 1);
}

#[rstest]
#[tokio::test]
async fn test_replaced_framing(_setup: ()) {
    let (a, _ra, _a_rx) = new_conn(1, config());
    let (b, _rb, mut b_rx) = new_conn(2, config());
    a.set_packer(Arc::new(PrefixSuffixPacker::new(b"<", b">\n", 4000).unwrap()));
    b.set_unpacker(Box::new(
        PrefixSuffixUnpacker::new(b"<", b">\n", 4000).unwrap(),
    ));
    start_pair(&a, &b);

    a.send(&[b"first"], false).unwrap();
    a.send(&[b"second"], false).unwrap();
    assert_eq!(next_event(&mut b_rx).await, Event::Message(b"first".to_vec()));
    assert_eq!(next_event(&mut b_rx).await, Event::Message(b"second".to_vec()));

    a.force_shutdown();
    b.force_shutdown();
}

#[rstest]
#[tokio::test]
async fn test_send_notifications(_setup: ()) {
    let cfg = ConnectionConfig {
        want_msg_send_notify: true,
        want_all_msg_send_notify: true,
        ..config()
    };
    let (a, ra, _a_rx) = new_conn(1, cfg);
    let (b, _rb, mut b_rx) = new_conn(2, config());
    start_pair(&a, &b);

    for msg in [&b"x"[..], b"y", b"z"] {
        a.send(&[msg], false).unwrap();
    }
    for _ in 0..3 {
        next_event(&mut b_rx).await;
    }
    wait_until(|| ra.sent.load(Ordering::SeqCst) == 3).await;
    wait_until(|| ra.all_sent.load(Ordering::SeqCst) >= 1).await;

    a.force_shutdown();
    b.force_shutdown();
}

#[rstest]
#[tokio::test]
async fn test_start_twice_fails(_setup: ()) {
    let (a, _ra, _a_rx) = new_conn(1, config());
    let (b, _rb, _b_rx) = new_conn(2, config());
    start_pair(&a, &b);

    let (other, _keep) = tokio::io::duplex(64);
    let (reader, writer) = tokio::io::split(other);
    assert!(matches!(
        a.start(reader, writer),
        Err(AppError::IllegalStateError(_))
    ));

    a.force_shutdown();
    b.force_shutdown();
}

#[rstest]
#[tokio::test]
async fn test_graceful_shutdown_with_cooperating_peer(_setup: ()) {
    let (a, ra, _a_rx) = new_conn(1, config());
    let (b, rb, _b_rx) = new_conn(2, config());
    start_pair(&a, &b);

    let begin = Instant::now();
    assert!(!a.graceful_shutdown(true).await);
    assert!(begin.elapsed() < Duration::from_millis(2000));
    assert_eq!(a.shutdown_state(), ShutdownState::Closed);

    wait_until(|| b.shutdown_state() == ShutdownState::Closed).await;
    wait_until(|| a.obsoleted() && b.obsoleted()).await;
    assert_eq!(ra.closes.load(Ordering::SeqCst), 1);
    assert_eq!(rb.closes.load(Ordering::SeqCst), 1);
}

#[rstest]
#[tokio::test]
async fn test_graceful_shutdown_waits_for_inflight_write(_setup: ()) {
    let (a, ra, _a_rx) = new_conn(1, config());
    let (local, mut peer) = tokio::io::duplex(64);
    let (reader, writer) = tokio::io::split(local);
    a.start(reader, writer).unwrap();

    // the frame does not fit the pipe, the write stays outstanding
    a.send(&[&[7u8; 100]], false).unwrap();
    assert!(a.is_sending());

    let closing = tokio::spawn({
        let a = a.clone();
        async move {
            let begin = Instant::now();
            let pending = a.graceful_shutdown(true).await;
            (pending, begin.elapsed())
        }
    });
    sleep(Duration::from_millis(20)).await;
    assert_eq!(a.shutdown_state(), ShutdownState::GracefulPending);
    assert!(a.is_sending());

    // the half-close follows the write, so the peer sees every byte then EOF
    let mut wire = Vec::new();
    timeout(Duration::from_secs(5), peer.read_to_end(&mut wire))
        .await
        .expect("no EOF from the closing side")
        .unwrap();
    assert_eq!(wire.len(), 102);
    assert_eq!(&wire[..2], &[0, 102]);
    assert!(wire[2..].iter().all(|b| *b == 7));

    // the peer closing its side completes the shutdown
    drop(peer);
    let (pending, elapsed) = closing.await.unwrap();
    assert!(!pending);
    assert!(elapsed < Duration::from_millis(2000));
    assert_eq!(a.shutdown_state(), ShutdownState::Closed);
    assert_eq!(ra.closes.load(Ordering::SeqCst), 1);
    wait_until(|| a.obsoleted()).await;
}

#[rstest]
#[tokio::test]
async fn test_graceful_shutdown_async(_setup: ()) {
    let (a, ra, _a_rx) = new_conn(1, config());
    let (b, _rb, _b_rx) = new_conn(2, config());
    start_pair(&a, &b);

    assert!(a.graceful_shutdown(false).await);
    assert!(a.is_shutting_down());
    assert!(!a.obsoleted());
    assert!(matches!(a.send(&[b"late"], false), Err(AppError::ShuttingDown)));
    // a second request is rejected while the first is pending
    assert!(!a.graceful_shutdown(false).await);

    wait_until(|| a.shutdown_state() == ShutdownState::Closed).await;
    wait_until(|| a.obsoleted()).await;
    assert_eq!(ra.closes.load(Ordering::SeqCst), 1);
}

#[rstest]
#[tokio::test]
async fn test_graceful_shutdown_times_out(_setup: ()) {
    let cfg = ConnectionConfig {
        graceful_shutdown_timeout_ms: 200,
        ..config()
    };
    let (a, ra, _a_rx) = new_conn(1, cfg);
    let (b, rb, _b_rx) = new_conn(2, config());
    rb.stubborn.store(true, Ordering::SeqCst);
    start_pair(&a, &b);

    let begin = Instant::now();
    assert!(!a.graceful_shutdown(true).await);
    assert!(begin.elapsed() >= Duration::from_millis(200));
    assert_eq!(a.shutdown_state(), ShutdownState::Closed);
    assert_eq!(ra.closes.load(Ordering::SeqCst), 1);

    // closing is idempotent
    a.force_shutdown();
    assert!(!a.graceful_shutdown(true).await);
    assert_eq!(ra.closes.load(Ordering::SeqCst), 1);

    assert_eq!(b.shutdown_state(), ShutdownState::Active);
    b.force_shutdown();
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_budget_follows_runtime_clock(_setup: ()) {
    let cfg = ConnectionConfig {
        graceful_shutdown_timeout_ms: 5000,
        ..config()
    };
    let (a, ra, _a_rx) = new_conn(1, cfg);
    let (b, rb, _b_rx) = new_conn(2, config());
    rb.stubborn.store(true, Ordering::SeqCst);
    start_pair(&a, &b);

    let wall = Instant::now();
    let clock = tokio::time::Instant::now();
    assert!(!a.graceful_shutdown(true).await);
    assert!(clock.elapsed() >= Duration::from_millis(5000));
    // the paused clock jumps ahead, nothing waits in real time
    assert!(wall.elapsed() < Duration::from_millis(2000));
    assert_eq!(a.shutdown_state(), ShutdownState::Closed);
    assert_eq!(ra.closes.load(Ordering::SeqCst), 1);

    b.force_shutdown();
}

#[rstest]
#[tokio::test]
async fn test_graceful_shutdown_without_transport(_setup: ()) {
    let (a, ra, _a_rx) = new_conn(1, config());
    assert!(!a.graceful_shutdown(true).await);
    assert_eq!(a.shutdown_state(), ShutdownState::Closed);
    assert_eq!(ra.closes.load(Ordering::SeqCst), 1);
}

#[rstest]
#[tokio::test]
async fn test_force_shutdown_then_reset(_setup: ()) {
    let (a, ra, mut a_rx) = new_conn(1, config());
    let (b, rb, _b_rx) = new_conn(2, config());
    start_pair(&a, &b);
    a.send(&[b"before"], false).unwrap();
    wait_until(|| a.statistic().send_msg_sum == 1).await;

    a.force_shutdown();
    a.force_shutdown();
    assert_eq!(ra.closes.load(Ordering::SeqCst), 1);
    assert!(!a.is_started());
    assert!(matches!(a.send(&[b"after"], false), Err(AppError::ShuttingDown)));

    // the peer sees the transport closing
    wait_until(|| b.shutdown_state() == ShutdownState::Closed).await;
    assert_eq!(rb.closes.load(Ordering::SeqCst), 1);

    wait_until(|| a.obsoleted()).await;
    a.reset().unwrap();
    assert_eq!(a.shutdown_state(), ShutdownState::Active);
    assert_eq!(a.statistic().send_msg_sum, 0);

    let (c, _rc, _c_rx) = new_conn(3, config());
    start_pair(&a, &c);
    assert!(matches!(a.reset(), Err(AppError::IllegalStateError(_))));
    c.send(&[b"again"], false).unwrap();
    assert_eq!(next_event(&mut a_rx).await, Event::Message(b"again".to_vec()));

    a.force_shutdown();
    c.force_shutdown();
}
