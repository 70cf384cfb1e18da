//! `heart-beat` header parsing and negotiation.

use std::time::Duration;

/// A `heart-beat: x,y` pair: how often a peer can send (`x`) and how often
/// it wants to receive (`y`). Zero means "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub outgoing: Duration,
    pub incoming: Duration,
}

impl HeartBeat {
    pub fn new(outgoing: Duration, incoming: Duration) -> Self {
        Self { outgoing, incoming }
    }

    /// Parses a header value such as `"5000,5000"`.
    pub fn parse(value: &str) -> Option<Self> {
        let (x, y) = value.split_once(',')?;
        let x: u64 = x.trim().parse().ok()?;
        let y: u64 = y.trim().parse().ok()?;
        Some(Self::new(Duration::from_millis(x), Duration::from_millis(y)))
    }

    /// Formats the header value in milliseconds.
    pub fn to_header_value(&self) -> String {
        format!(
            "{},{}",
            self.outgoing.as_millis(),
            self.incoming.as_millis()
        )
    }

    /// Negotiates the effective intervals from the client's offer and the
    /// server's CONNECTED reply.
    ///
    /// The result is from the client's point of view: `outgoing` is how
    /// often the client must send, `incoming` how often it should expect
    /// to hear from the server. Zero disables the direction.
    pub fn negotiate(client: HeartBeat, server: HeartBeat) -> HeartBeat {
        let pick = |ours: Duration, theirs: Duration| {
            if ours.is_zero() || theirs.is_zero() {
                Duration::ZERO
            } else {
                ours.max(theirs)
            }
        };
        HeartBeat {
            outgoing: pick(client.outgoing, server.incoming),
            incoming: pick(client.incoming, server.outgoing),
        }
    }
}
