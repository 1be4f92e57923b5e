/// The `NetworkStats` struct contains statistics about the connection to one remote peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// Number of local inputs the remote peer has not acknowledged yet.
    ///
    /// A rough indication of connection quality: the queue grows with round-trip time and during
    /// packet loss.
    pub send_queue_len: usize,
    /// The most recent round-trip time, in milliseconds.
    pub ping: u64,
    /// The estimated bandwidth used towards the peer, in kilobits per second.
    pub kbps_sent: usize,

    /// The number of frames the local client is estimated to be behind the remote client.
    /// If this client runs frame 1002 and the remote runs frame 1009, this is roughly 7.
    pub local_frames_behind: i32,
    /// The same as [`local_frames_behind`], as reported by the remote peer.
    ///
    /// [`local_frames_behind`]: #structfield.local_frames_behind
    pub remote_frames_behind: i32,
}

impl NetworkStats {
    /// Creates a new `NetworkStats` instance with default values.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            send_queue_len,
            ping,
            kbps_sent,
            local_frames_behind,
            remote_frames_behind,
        } = self;

        write!(
            f,
            "NetworkStats {{ ping: {}ms, queue: {}, kbps: {}, local_behind: {}, remote_behind: {} }}",
            ping, send_queue_len, kbps_sent, local_frames_behind, remote_frames_behind
        )
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn test_network_stats_default() {
        let stats = NetworkStats::default();
        assert_eq!(stats.send_queue_len, 0);
        assert_eq!(stats.ping, 0);
        assert_eq!(stats.kbps_sent, 0);
        assert_eq!(stats.local_frames_behind, 0);
        assert_eq!(stats.remote_frames_behind, 0);
        assert_eq!(NetworkStats::new(), stats);
    }

    #[test]
    fn test_network_stats_display() {
        let stats = NetworkStats {
            send_queue_len: 3,
            ping: 42,
            kbps_sent: 12,
            local_frames_behind: -1,
            remote_frames_behind: 2,
        };
        let text = stats.to_string();
        assert!(text.contains("ping: 42ms"));
        assert!(text.contains("queue: 3"));
        assert!(text.contains("local_behind: -1"));
        assert!(text.contains("remote_behind: 2"));
    }
}
