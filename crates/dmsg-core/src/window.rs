//! Stream flow-control windows.
//!
//! Both counters are offset based. The receiver acknowledges the cumulative
//! number of bytes it has consumed, so duplicated or stale ACKs are harmless:
//! the acknowledged offset only moves forward.

use crate::error::Error;

/// Credit for bytes we may still send to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteWindow {
    size: u64,
    sent: u64,
    acked: u64,
}

impl RemoteWindow {
    /// Window advertised by the peer
    #[must_use]
    pub fn new(size: u32) -> Self {
        Self {
            size: u64::from(size),
            sent: 0,
            acked: 0,
        }
    }

    /// Bytes that may be sent right now
    #[must_use]
    pub fn available(&self) -> u64 {
        self.size.saturating_sub(self.sent - self.acked)
    }

    /// Bytes sent but not yet acknowledged
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.sent - self.acked
    }

    /// Total bytes sent
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Account for `n` bytes leaving in a FWD frame.
    ///
    /// # Errors
    ///
    /// Fails if `n` exceeds the available credit.
    pub fn consume(&mut self, n: u64) -> Result<(), Error> {
        if n > self.available() {
            return Err(Error::protocol(format!(
                "fwd of {n} bytes exceeds remote window of {}",
                self.available()
            )));
        }
        self.sent += n;
        Ok(())
    }

    /// Apply an ACK offset. Returns whether the window opened.
    ///
    /// # Errors
    ///
    /// Fails if the peer acknowledges bytes that were never sent.
    pub fn ack(&mut self, offset: u64) -> Result<bool, Error> {
        if offset > self.sent {
            return Err(Error::protocol(format!(
                "ack offset {offset} beyond sent {}",
                self.sent
            )));
        }
        if offset <= self.acked {
            return Ok(false);
        }
        self.acked = offset;
        Ok(true)
    }
}

/// Credit we granted the peer for sending to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalWindow {
    size: u64,
    received: u64,
    consumed: u64,
}

impl LocalWindow {
    /// Window we advertise
    #[must_use]
    pub fn new(size: u32) -> Self {
        Self {
            size: u64::from(size),
            received: 0,
            consumed: 0,
        }
    }

    /// Bytes the peer may still send
    #[must_use]
    pub fn available(&self) -> u64 {
        self.size - (self.received - self.consumed)
    }

    /// Account for an incoming FWD payload.
    ///
    /// # Errors
    ///
    /// Fails if the peer overran the granted window.
    pub fn receive(&mut self, n: u64) -> Result<(), Error> {
        if n > self.available() {
            return Err(Error::protocol(format!(
                "peer sent {n} bytes with only {} granted",
                self.available()
            )));
        }
        self.received += n;
        Ok(())
    }

    /// Mark `n` buffered bytes as read; returns the offset to acknowledge.
    pub fn consume(&mut self, n: u64) -> u64 {
        debug_assert!(self.consumed + n <= self.received);
        self.consumed = (self.consumed + n).min(self.received);
        self.consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_remote_window_blocks_then_opens() {
        let mut w = RemoteWindow::new(10);
        w.consume(6).unwrap();
        assert_eq!(w.available(), 4);
        assert!(w.consume(5).is_err());
        w.consume(4).unwrap();
        assert_eq!(w.available(), 0);
        assert!(w.ack(6).unwrap());
        assert_eq!(w.available(), 6);
    }

    #[test]
    fn test_stale_ack_ignored() {
        let mut w = RemoteWindow::new(10);
        w.consume(8).unwrap();
        assert!(w.ack(8).unwrap());
        assert!(!w.ack(3).unwrap());
        assert!(!w.ack(8).unwrap());
        assert_eq!(w.available(), 10);
    }

    #[test]
    fn test_ack_beyond_sent_is_violation() {
        let mut w = RemoteWindow::new(10);
        w.consume(2).unwrap();
        assert!(matches!(w.ack(3), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_local_window_overrun() {
        let mut w = LocalWindow::new(8);
        w.receive(8).unwrap();
        assert!(w.receive(1).is_err());
        assert_eq!(w.consume(5), 5);
        assert_eq!(w.available(), 5);
        w.receive(5).unwrap();
        assert_eq!(w.consume(8), 13);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(u64),
        Read(u64),
        ReplayAck,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..5000).prop_map(Op::Write),
            (1u64..5000).prop_map(Op::Read),
            Just(Op::ReplayAck),
        ]
    }

    proptest! {
        // Writer and reader exchanging FWD/ACK never exceed the granted window.
        #[test]
        fn prop_window_conservation(size in 1u32..8192, ops in proptest::collection::vec(op(), 1..200)) {
            let mut tx = RemoteWindow::new(size);
            let mut rx = LocalWindow::new(size);
            let mut buffered = 0u64;
            let mut acks: Vec<u64> = vec![0];

            for op in ops {
                match op {
                    Op::Write(want) => {
                        let n = want.min(tx.available());
                        if n == 0 {
                            continue;
                        }
                        tx.consume(n).unwrap();
                        rx.receive(n).unwrap();
                        buffered += n;
                    }
                    Op::Read(want) => {
                        let n = want.min(buffered);
                        if n == 0 {
                            continue;
                        }
                        buffered -= n;
                        let offset = rx.consume(n);
                        tx.ack(offset).unwrap();
                        acks.push(offset);
                    }
                    Op::ReplayAck => {
                        let old = acks[acks.len() / 2];
                        tx.ack(old).unwrap();
                    }
                }
                prop_assert!(tx.outstanding() <= u64::from(size));
                prop_assert_eq!(tx.outstanding(), buffered);
                prop_assert_eq!(tx.available(), rx.available());
            }
        }
    }
}
