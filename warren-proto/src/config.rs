use std::time::Duration;

/// Parameters governing the streaming state machine
///
/// The defaults reproduce the behavior of mainline I2P streaming over real
/// tunnels: an enormous initial RTT (a fresh path through several hops can
/// genuinely take seconds), a small initial window, and conservative
/// retransmission. Interactive applications over fast paths may want to lower
/// `initial_rtt`/`initial_rto`; bulk transfer may want a larger
/// `max_window_size`.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub(crate) initial_rtt: Duration,
    pub(crate) initial_rto: Duration,
    pub(crate) min_rto: Duration,
    pub(crate) initial_window_size: u32,
    pub(crate) min_window_size: u32,
    pub(crate) max_window_size: u32,
    pub(crate) initial_pacing_time: Duration,
    pub(crate) mtu: usize,
    pub(crate) mtu_ratchets: usize,
    pub(crate) max_packet_size: usize,
    pub(crate) min_send_ack_timeout: Duration,
    pub(crate) syn_timeout: Duration,
    pub(crate) delay_choking: u16,
    pub(crate) max_resend_attempts: u32,
    pub(crate) rtt_ewma_alpha: f64,
    pub(crate) max_pending_incoming: usize,
    pub(crate) pending_incoming_timeout: Duration,
    pub(crate) leaseset_confirmation_timeout: Duration,
    pub(crate) lease_expiration_threshold: Duration,
    pub(crate) ack_delay: Duration,
    pub(crate) outbound_speed: Option<u64>,
    pub(crate) answer_pings: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        const INITIAL_RTT_MS: u64 = 8_000;
        const INITIAL_WINDOW_SIZE: u32 = 6;
        Self {
            initial_rtt: Duration::from_millis(INITIAL_RTT_MS),
            initial_rto: Duration::from_millis(9_000),
            min_rto: Duration::from_millis(20),
            initial_window_size: INITIAL_WINDOW_SIZE,
            min_window_size: 1,
            max_window_size: 128,
            initial_pacing_time: Duration::from_micros(
                1_000 * INITIAL_RTT_MS / INITIAL_WINDOW_SIZE as u64,
            ),
            mtu: 1730,
            mtu_ratchets: 1812,
            max_packet_size: crate::packet::MAX_PACKET_SIZE,
            min_send_ack_timeout: Duration::from_millis(2),
            syn_timeout: Duration::from_millis(200),
            delay_choking: 60_000,
            max_resend_attempts: 9,
            rtt_ewma_alpha: 0.125,
            max_pending_incoming: 128,
            pending_incoming_timeout: Duration::from_secs(10),
            leaseset_confirmation_timeout: Duration::from_secs(4),
            lease_expiration_threshold: Duration::from_secs(51),
            ack_delay: Duration::from_millis(200),
            outbound_speed: None,
            answer_pings: true,
        }
    }
}

impl StreamingConfig {
    /// The RTT assumed for a path before any sample has been taken
    pub fn initial_rtt(&mut self, value: Duration) -> &mut Self {
        self.initial_rtt = value;
        self
    }

    /// The retransmission timeout used until RTT measurements refine it
    ///
    /// While the RTO still has this value, timeout retransmissions reset the
    /// congestion state to a fresh-path profile rather than halving the
    /// window, on the assumption that the path itself was bad.
    pub fn initial_rto(&mut self, value: Duration) -> &mut Self {
        self.initial_rto = value;
        self
    }

    /// Lower bound on the retransmission timeout
    pub fn min_rto(&mut self, value: Duration) -> &mut Self {
        self.min_rto = value;
        self
    }

    /// Number of in-flight packets allowed before the first ACK arrives
    pub fn initial_window_size(&mut self, value: u32) -> &mut Self {
        self.initial_window_size = value;
        self
    }

    /// Floor applied after every window reduction
    pub fn min_window_size(&mut self, value: u32) -> &mut Self {
        self.min_window_size = value;
        self
    }

    /// Hard cap on the congestion window, in packets
    pub fn max_window_size(&mut self, value: u32) -> &mut Self {
        self.max_window_size = value;
        self
    }

    /// Interval between send opportunities before pacing adapts to the RTT
    pub fn initial_pacing_time(&mut self, value: Duration) -> &mut Self {
        self.initial_pacing_time = value;
        self
    }

    /// Maximum payload of a single stream packet on ElGamal/AES sessions
    pub fn mtu(&mut self, value: usize) -> &mut Self {
        self.mtu = value;
        self
    }

    /// Maximum payload of a single stream packet on ratchet sessions
    pub fn mtu_ratchets(&mut self, value: usize) -> &mut Self {
        self.mtu_ratchets = value;
        self
    }

    /// Largest decompressed stream packet accepted from the substrate
    pub fn max_packet_size(&mut self, value: usize) -> &mut Self {
        self.max_packet_size = value;
        self
    }

    /// Floor on the delay before an ACK is emitted
    pub fn min_send_ack_timeout(&mut self, value: Duration) -> &mut Self {
        self.min_send_ack_timeout = value;
        self
    }

    /// How long a stream created by a follow-on packet waits for its SYN
    pub fn syn_timeout(&mut self, value: Duration) -> &mut Self {
        self.syn_timeout = value;
        self
    }

    /// `delayRequested` value, in milliseconds, that demands the peer choke
    /// its window to one packet
    pub fn delay_choking(&mut self, value: u16) -> &mut Self {
        self.delay_choking = value;
        self
    }

    /// Retransmission attempts before the stream is reset
    pub fn max_resend_attempts(&mut self, value: u32) -> &mut Self {
        self.max_resend_attempts = value;
        self
    }

    /// Weight of a fresh sample in the RTT/jitter moving averages
    pub fn rtt_ewma_alpha(&mut self, value: f64) -> &mut Self {
        self.rtt_ewma_alpha = value;
        self
    }

    /// Incoming streams held for an acceptor before new ones are refused
    pub fn max_pending_incoming(&mut self, value: usize) -> &mut Self {
        self.max_pending_incoming = value;
        self
    }

    /// How long unclaimed incoming streams and orphan follow-on packets are
    /// kept before being dropped
    pub fn pending_incoming_timeout(&mut self, value: Duration) -> &mut Self {
        self.pending_incoming_timeout = value;
        self
    }

    /// How long to wait for the peer to confirm our leaseset before
    /// re-announcing it over a different path
    pub fn leaseset_confirmation_timeout(&mut self, value: Duration) -> &mut Self {
        self.leaseset_confirmation_timeout = value;
        self
    }

    /// Margin before a lease's end date at which it is treated as expired
    pub fn lease_expiration_threshold(&mut self, value: Duration) -> &mut Self {
        self.lease_expiration_threshold = value;
        self
    }

    /// Upper bound on how long an ACK may be delayed
    pub fn ack_delay(&mut self, value: Duration) -> &mut Self {
        self.ack_delay = value;
        self
    }

    /// Outbound throughput cap in bytes per second
    ///
    /// When set, pacing never schedules sends faster than this rate allows at
    /// the configured MTU. `None` leaves pacing purely RTT-driven.
    pub fn outbound_speed(&mut self, value: Option<u64>) -> &mut Self {
        self.outbound_speed = value;
        self
    }

    /// Whether echo (ping) packets addressed to unknown streams are answered
    pub fn answer_pings(&mut self, value: bool) -> &mut Self {
        self.answer_pings = value;
        self
    }

    /// Microseconds between send opportunities implied by `outbound_speed`
    pub(crate) fn min_pacing_time(&self) -> Option<Duration> {
        self.outbound_speed
            .map(|speed| Duration::from_micros(1_000_000 * self.mtu as u64 / speed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pacing_matches_initial_window() {
        let config = StreamingConfig::default();
        let per_packet = config.initial_rtt.as_micros() / config.initial_window_size as u128;
        assert_eq!(config.initial_pacing_time.as_micros(), per_packet);
    }

    #[test]
    fn outbound_speed_caps_pacing() {
        let mut config = StreamingConfig::default();
        assert_eq!(config.min_pacing_time(), None);
        config.outbound_speed(Some(173_000));
        // 1730-byte packets at 173 kB/s is one packet per 10ms
        assert_eq!(
            config.min_pacing_time(),
            Some(Duration::from_millis(10))
        );
    }
}
