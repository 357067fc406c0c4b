use limepcie::{
    endpoints::DEVICE_CONFIGS,
    prelude::*,
    streaming::DEFAULT_FAILURE_THRESHOLD,
    transport::mock::{
        Channel,
        Event,
        Mock,
    },
};
use paste::paste;
use std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
    },
    time::{
        Duration,
        Instant,
    },
};

fn board(index: usize) -> (Mock, Arc<Connection>) {
    let mock = Mock::with_boards(&[0, 1]);
    mock.loopback_control(&DEVICE_CONFIGS[index]);
    let conn = Connection::connect(Arc::new(mock.clone()), index, Config::default()).unwrap();
    (mock, Arc::new(conn))
}

macro_rules! test_lifecycle {
    ($index:literal) => {
        paste! {
            #[test]
            fn [<test_lifecycle_board_ $index>]() {
                let (mock, conn) = board($index);
                assert!(conn.is_open());
                assert_eq!(conn.opened_index(), Some($index));
                for ep in 0..conn.stream_count() {
                    assert!(conn.endpoint_path(EndpointId::StreamRead(ep)).is_some());
                    assert!(conn.endpoint_path(EndpointId::StreamWrite(ep)).is_some());
                }
                conn.close();
                conn.close();
                assert!(!conn.is_open());
                assert_eq!(conn.opened_index(), None);
                assert_eq!(mock.open_handles(), 0);
            }
        }
    };
}

test_lifecycle!(0);
test_lifecycle!(1);

/// Receives into 64 byte segments. The board only delivers half a segment for the first three
/// iterations and a full one on the fourth.
struct HalfThenFull {
    channel: Arc<Channel>,
    iteration: usize,
    reports: Vec<TransferReport>,
}

impl StreamSession for HalfThenFull {
    fn endpoint_index(&self) -> usize {
        0
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(30)
    }

    fn is_terminated(&self) -> bool {
        false
    }

    fn acquire(&mut self) -> Option<Vec<u8>> {
        self.iteration += 1;
        match self.iteration {
            1..=3 => self.channel.feed(&[0x5A; 32]),
            4 => self.channel.feed(&[0xA5; 64]),
            _ => return None,
        }
        Some(vec![0; 64])
    }

    fn complete(&mut self, segment: Vec<u8>, report: TransferReport) {
        if self.iteration == 4 {
            assert!(segment.iter().all(|&b| b == 0xA5));
        }
        self.reports.push(report);
    }
}

/// Sends 32 byte segments until told to stop
struct Sender {
    ep: usize,
    stop: Arc<AtomicBool>,
    sent: usize,
}

impl StreamSession for Sender {
    fn endpoint_index(&self) -> usize {
        self.ep
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(30)
    }

    fn is_terminated(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn acquire(&mut self) -> Option<Vec<u8>> {
        Some(vec![self.ep as u8; 32])
    }

    fn complete(&mut self, _segment: Vec<u8>, report: TransferReport) {
        self.sent += report.transferred();
    }
}

#[test]
fn test_loops_survive_partial_iterations() {
    let (mock, conn) = board(1);
    mock.endpoint("/dev/xillybus_stream1_write_32")
        .limit_writes(Some(4096));
    let stop = Arc::new(AtomicBool::new(false));
    let mut rx = HalfThenFull {
        channel: mock.endpoint("/dev/xillybus_stream0_read_32"),
        iteration: 0,
        reports: vec![],
    };
    let mut tx = Sender {
        ep: 1,
        stop: stop.clone(),
        sent: 0,
    };
    std::thread::scope(|s| {
        let transmit = s.spawn(|| conn.transmit_packets_loop(&mut tx));
        let exit = conn.receive_packets_loop(&mut rx).unwrap();
        assert_eq!(exit, LoopExit::Terminated);
        stop.store(true, Ordering::Release);
        assert_eq!(transmit.join().unwrap().unwrap(), LoopExit::Terminated);
    });
    assert_eq!(rx.reports.len(), 4);
    for report in &rx.reports[..3] {
        assert!(report.is_partial());
        assert_eq!(report.transferred(), 32);
    }
    assert!(!rx.reports[3].is_partial());
    assert_eq!(rx.reports[3].transferred(), 64);
    let written = mock.endpoint("/dev/xillybus_stream1_write_32").take_written();
    assert!(!written.is_empty());
    assert_eq!(written.len(), tx.sent);
    assert!(written.iter().all(|&b| b == 1));
    assert!(conn.is_open());
}

#[test]
fn test_abort_stops_blocked_loop() {
    let (_mock, conn) = board(1);
    let stop = Arc::new(AtomicBool::new(false));
    let mut rx = Sender {
        ep: 1,
        stop,
        sent: 0,
    };
    let granularity = conn.config().poll_granularity;
    let latency = std::thread::scope(|s| {
        let receive = s.spawn(|| conn.receive_packets_loop(&mut rx));
        std::thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        conn.abort_reading(1).unwrap();
        assert_eq!(receive.join().unwrap().unwrap(), LoopExit::Aborted);
        start.elapsed()
    });
    assert!(latency <= 2 * granularity + Duration::from_millis(20));
    assert_eq!(rx.sent, 0);
}

#[test]
fn test_failing_device_ends_loop() {
    let (mock, conn) = board(0);
    let channel = mock.endpoint("/dev/xillybus_read_32");
    for _ in 0..DEFAULT_FAILURE_THRESHOLD {
        channel.fail_next(5);
    }
    let mut rx = Sender {
        ep: 0,
        stop: Arc::new(AtomicBool::new(false)),
        sent: 0,
    };
    let err = conn.receive_packets_loop(&mut rx).unwrap_err();
    assert!(matches!(
        err,
        limepcie::Error::TooManyFailures {
            failures: DEFAULT_FAILURE_THRESHOLD,
            ..
        }
    ));
}

/// Every write on the control endpoints must be followed by its read before the next write
fn assert_paired(mock: &Mock, index: usize) {
    let hw = &DEVICE_CONFIGS[index];
    let mut expect_write = true;
    for event in mock.events() {
        match event {
            Event::Write { path, len } if path == hw.ctrl_write => {
                assert!(expect_write, "two control writes in a row");
                assert_eq!(len, 64);
                expect_write = false;
            }
            Event::Read { path, len } if path == hw.ctrl_read => {
                assert!(!expect_write, "control read without a request");
                assert_eq!(len, 64);
                expect_write = true;
            }
            _ => {}
        }
    }
    assert!(expect_write);
}

#[test]
fn test_concurrent_transfers_never_interleave() {
    let (mock, conn) = board(1);
    std::thread::scope(|s| {
        for tag in 1..=4u8 {
            let conn = &conn;
            s.spawn(move || {
                for i in 0..25u8 {
                    let mut pkt = ControlPacket::with_data(Command::GpioWr, vec![tag, i]);
                    conn.transfer_packet(&mut pkt).unwrap();
                    assert_eq!(pkt.status, Status::Completed);
                    assert_eq!(&pkt.in_buffer[..2], &[tag, i]);
                }
            });
        }
    });
    assert_paired(&mock, 1);
}

/// Writes three registers for every rate change
struct ThreeWrites;

impl PllProgrammer for ThreeWrites {
    fn program(&mut self, port: &mut ControlPort<'_>, request: &PllRequest) -> anyhow::Result<()> {
        for step in 0..3u16 {
            port.write_registers(&[(0x0023, (u16::from(request.pll_index) << 8) | step)])?;
        }
        Ok(())
    }
}

#[test]
fn test_rate_change_during_transfers() {
    let mock = Mock::with_boards(&[1]);
    let hw = &DEVICE_CONFIGS[1];
    let commands = Arc::new(Mutex::new(Vec::new()));
    let seen = commands.clone();
    mock.respond_with(hw.ctrl_write, hw.ctrl_read, move |frame| {
        seen.lock().unwrap().push(frame[0]);
        let mut reply = *frame;
        reply[1] = Status::Completed as u8;
        reply
    });
    let conn = Connection::connect(Arc::new(mock.clone()), 1, Config::default()).unwrap();
    conn.set_pll_programmer(Box::new(ThreeWrites));
    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..20u8 {
                let mut pkt = ControlPacket::with_data(Command::GpioWr, vec![i]);
                conn.transfer_packet(&mut pkt).unwrap();
                assert_eq!(pkt.in_buffer[0], i);
            }
        });
        s.spawn(|| {
            conn.update_external_data_rate(0, 30.72e6, 30.72e6).unwrap();
            conn.update_external_data_rate_with_phase(1, 10e6, 10e6, 15.0, 30.0)
                .unwrap();
        });
    });
    let commands = commands.lock().unwrap();
    assert_eq!(commands.len(), 26);
    // Each rate change's register writes arrive back to back
    let mut run = 0;
    for &cmd in commands.iter().chain(std::iter::once(&0)) {
        if cmd == Command::BrdSpiWr as u8 {
            run += 1;
        } else {
            assert_eq!(run % 3, 0, "a rate change was split by another exchange");
            run = 0;
        }
    }
    assert_paired(&mock, 1);
}

#[test]
fn test_drop_closes_everything() {
    let (mock, conn) = board(1);
    assert_eq!(mock.open_handles(), 6);
    drop(conn);
    assert_eq!(mock.open_handles(), 0);
}
