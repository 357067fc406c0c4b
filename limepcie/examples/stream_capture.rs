//! In this example, we will find a PCIe board, print what it reports about itself, and capture a
//! few megabytes from its first stream endpoint.

use limepcie::{
    prelude::*,
    registry,
};
use std::{
    sync::Arc,
    time::Duration,
};

const CAPTURE_BYTES: usize = 4 << 20;
const SEGMENT: usize = 64 << 10;

/// Collects segments until it has enough
struct Capture {
    captured: usize,
    partial: usize,
}

impl StreamSession for Capture {
    fn endpoint_index(&self) -> usize {
        0
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(500)
    }

    fn is_terminated(&self) -> bool {
        self.captured >= CAPTURE_BYTES
    }

    fn acquire(&mut self) -> Option<Vec<u8>> {
        Some(vec![0; SEGMENT])
    }

    fn complete(&mut self, _segment: Vec<u8>, report: TransferReport) {
        if report.is_partial() {
            self.partial += 1;
        }
        self.captured += report.transferred();
    }
}

fn main() -> anyhow::Result<()> {
    let backend = Arc::new(DevFs);
    let boards = registry::enumerate(backend.as_ref(), &ConnectionHandle::default());
    let Some(handle) = boards.first() else {
        anyhow::bail!("No PCIe boards found");
    };
    println!("Using {handle}");
    let conn = registry::make(backend, handle, Config::default())?;
    let info = conn.device_info()?;
    println!(
        "Firmware {}, hardware {}, protocol {}, serial {:016x}",
        info.firmware, info.hardware, info.protocol, info.serial
    );
    let mut session = Capture {
        captured: 0,
        partial: 0,
    };
    let exit = conn.receive_packets_loop(&mut session)?;
    println!(
        "Captured {} bytes ({} short reads), loop {exit:?}",
        session.captured, session.partial
    );
    Ok(())
}
