//! Fragmentation and Reassembly
//!
//! Compressed packets larger than the link's single-message limit are split
//! into tiles, each carried in a fragment tagged with the reserved rule id.
//!
//! ```text
//! +------+------+-----------------+
//! | 0x80 | 0x00 | tile            |   more fragments follow
//! +------+------+-----------------+
//! +------+------+--------+-----------------+
//! | 0x80 | 0xFF | MIC BE | tile            |   last fragment
//! +------+------+--------+-----------------+
//! ```
//!
//! The MIC is the Internet checksum of the whole compressed packet.

use std::time::{Duration, Instant};

use crate::checksum::internet_checksum;
use crate::error::{Result, SchcError};
use crate::packet::MTU;
use crate::rule::FRAGMENT_RULE_ID;

/// FCN of a fragment that is followed by more
pub const FCN_MORE: u8 = 0x00;
/// FCN of the last fragment, which carries the MIC
pub const FCN_LAST: u8 = 0xFF;
/// Largest LoRaWAN application payload
pub const MAX_LORAWAN_PKT_LEN: usize = 242;

pub const DEFAULT_MAX_PACKET_LEN: usize = 40;
pub const DEFAULT_TILE_SIZE: usize = 40;
pub const DEFAULT_REASSEMBLY_TTL: Duration = Duration::from_secs(60);

/// Header of a fragment that is not the last
pub const FRAGMENT_HEADER_LEN: usize = 2;
/// Header of the last fragment, MIC included
pub const LAST_FRAGMENT_HEADER_LEN: usize = 4;

// =============================================================================
// Fragmenter
// =============================================================================

/// Splits compressed packets into link-sized messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragmenter {
    max_packet_len: usize,
    tile_size: usize,
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self {
            max_packet_len: DEFAULT_MAX_PACKET_LEN,
            tile_size: DEFAULT_TILE_SIZE,
        }
    }
}

impl Fragmenter {
    pub fn new(max_packet_len: usize, tile_size: usize) -> Result<Self> {
        if max_packet_len == 0 || max_packet_len > MAX_LORAWAN_PKT_LEN {
            return Err(SchcError::Config(format!(
                "max_packet_len {} must be within 1..={}",
                max_packet_len, MAX_LORAWAN_PKT_LEN
            )));
        }
        if tile_size == 0 || tile_size + LAST_FRAGMENT_HEADER_LEN > MAX_LORAWAN_PKT_LEN {
            return Err(SchcError::Config(format!(
                "tile_size {} must be within 1..={}",
                tile_size,
                MAX_LORAWAN_PKT_LEN - LAST_FRAGMENT_HEADER_LEN
            )));
        }
        Ok(Self {
            max_packet_len,
            tile_size,
        })
    }

    pub fn max_packet_len(&self) -> usize {
        self.max_packet_len
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    /// Number of messages `len` bytes are sent in
    pub fn message_count(&self, len: usize) -> usize {
        if len <= self.max_packet_len {
            1
        } else {
            len.div_ceil(self.tile_size)
        }
    }

    /// Split a compressed packet into messages, in transmission order
    ///
    /// A packet within `max_packet_len` is returned unchanged as the only
    /// message.
    pub fn fragment(&self, packet: &[u8]) -> Result<Vec<Vec<u8>>> {
        if packet.is_empty() {
            return Err(SchcError::MalformedInput(
                "cannot fragment an empty packet".to_string(),
            ));
        }
        if packet.len() > MTU {
            return Err(SchcError::ResourceExhausted(format!(
                "compressed packet of {} bytes exceeds the {} byte MTU",
                packet.len(),
                MTU
            )));
        }
        if packet.len() <= self.max_packet_len {
            return Ok(vec![packet.to_vec()]);
        }

        let mic = internet_checksum(packet);
        let tiles: Vec<&[u8]> = packet.chunks(self.tile_size).collect();
        let last = tiles.len() - 1;
        log::debug!(
            "Fragmenting {} bytes into {} tiles, MIC {:#06x}",
            packet.len(),
            tiles.len(),
            mic
        );

        let messages = tiles
            .iter()
            .enumerate()
            .map(|(index, tile)| {
                let mut message = Vec::with_capacity(LAST_FRAGMENT_HEADER_LEN + tile.len());
                message.push(FRAGMENT_RULE_ID);
                if index == last {
                    message.push(FCN_LAST);
                    message.extend_from_slice(&mic.to_be_bytes());
                } else {
                    message.push(FCN_MORE);
                }
                message.extend_from_slice(tile);
                message
            })
            .collect();
        Ok(messages)
    }
}

// =============================================================================
// Reassembler
// =============================================================================

/// Rebuilds compressed packets from received messages
///
/// Holds at most one packet in progress. A partial packet older than the TTL
/// is dropped when the next message arrives or when [`Reassembler::expire`]
/// is polled.
#[derive(Debug, Clone)]
pub struct Reassembler {
    buffer: Vec<u8>,
    capacity: usize,
    started: Option<Instant>,
    ttl: Option<Duration>,
    evictions: u64,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(Some(DEFAULT_REASSEMBLY_TTL))
    }
}

impl Reassembler {
    /// `ttl` of `None` keeps a partial packet forever
    pub fn new(ttl: Option<Duration>) -> Self {
        Self::with_capacity(ttl, MTU)
    }

    pub fn with_capacity(ttl: Option<Duration>, capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            started: None,
            ttl,
            evictions: 0,
        }
    }

    /// True when no partial packet is held
    pub fn is_idle(&self) -> bool {
        self.started.is_none()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Partial packets dropped on TTL expiry so far
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.started = None;
    }

    pub fn receive(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>> {
        self.receive_at(message, Instant::now())
    }

    /// Process one received message at time `now`
    ///
    /// Returns the complete compressed packet once available, `None` while
    /// more fragments are expected.
    pub fn receive_at(&mut self, message: &[u8], now: Instant) -> Result<Option<Vec<u8>>> {
        let Some(&rule_id) = message.first() else {
            return Err(SchcError::MalformedInput("empty message".to_string()));
        };

        if rule_id != FRAGMENT_RULE_ID {
            return Ok(Some(message.to_vec()));
        }

        self.expire(now);

        let fcn = message.get(1).copied();
        if fcn == Some(FCN_LAST) {
            self.receive_last(message)
        } else {
            self.receive_more(message, now)
        }
    }

    /// Drop a partial packet older than the TTL; true if one was dropped
    pub fn expire(&mut self, now: Instant) -> bool {
        let expired = match (self.started, self.ttl) {
            (Some(started), Some(ttl)) => now.saturating_duration_since(started) > ttl,
            _ => false,
        };
        if expired {
            log::warn!(
                "Dropping partial packet of {} bytes after reassembly timeout",
                self.buffer.len()
            );
            self.evictions += 1;
            self.reset();
        }
        expired
    }

    fn receive_more(&mut self, message: &[u8], now: Instant) -> Result<Option<Vec<u8>>> {
        let tile = self.tile(message, FRAGMENT_HEADER_LEN)?;
        self.append(tile)?;
        self.started.get_or_insert(now);
        Ok(None)
    }

    fn receive_last(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>> {
        let tile = self.tile(message, LAST_FRAGMENT_HEADER_LEN)?;
        self.append(tile)?;

        let expected = u16::from_be_bytes([message[2], message[3]]);
        let packet = std::mem::take(&mut self.buffer);
        self.reset();

        let computed = internet_checksum(&packet);
        if computed != expected {
            return Err(SchcError::IntegrityMismatch { expected, computed });
        }
        log::debug!("Reassembled {} byte packet", packet.len());
        Ok(Some(packet))
    }

    fn tile<'a>(&mut self, message: &'a [u8], header_len: usize) -> Result<&'a [u8]> {
        match message.get(header_len..) {
            Some(tile) => Ok(tile),
            None => {
                self.reset();
                Err(SchcError::MalformedInput(format!(
                    "fragment of {} bytes shorter than its {} byte header",
                    message.len(),
                    header_len
                )))
            }
        }
    }

    fn append(&mut self, tile: &[u8]) -> Result<()> {
        if self.buffer.len() + tile.len() > self.capacity {
            let len = self.buffer.len() + tile.len();
            self.reset();
            return Err(SchcError::ResourceExhausted(format!(
                "reassembled packet of {} bytes exceeds {} bytes",
                len, self.capacity
            )));
        }
        self.buffer.extend_from_slice(tile);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn reassemble(reassembler: &mut Reassembler, messages: &[Vec<u8>]) -> Result<Option<Vec<u8>>> {
        let mut result = Ok(None);
        for message in messages {
            result = reassembler.receive(message);
        }
        result
    }

    // =========================================================================
    // Fragmenter tests
    // =========================================================================

    #[test]
    fn test_small_packet_unchanged() {
        let fragmenter = Fragmenter::default();
        let data = packet(40);
        assert_eq!(fragmenter.fragment(&data).unwrap(), vec![data]);
    }

    #[test]
    fn test_threshold_plus_one_splits_in_two() {
        let fragmenter = Fragmenter::default();
        let data = packet(41);
        let messages = fragmenter.fragment(&data).unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(&messages[0][..2], &[FRAGMENT_RULE_ID, FCN_MORE]);
        assert_eq!(&messages[0][2..], &data[..40]);

        let mic = internet_checksum(&data).to_be_bytes();
        assert_eq!(&messages[1][..4], &[FRAGMENT_RULE_ID, FCN_LAST, mic[0], mic[1]]);
        assert_eq!(&messages[1][4..], &data[40..]);
    }

    #[test]
    fn test_single_tile_above_threshold_is_last_fragment() {
        let fragmenter = Fragmenter::new(1, 2).unwrap();
        let data = vec![0x00, 0x00];
        let messages = fragmenter.fragment(&data).unwrap();

        assert_eq!(fragmenter.message_count(2), 1);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0],
            vec![FRAGMENT_RULE_ID, FCN_LAST, 0xFF, 0xFF, 0x00, 0x00]
        );

        let mut reassembler = Reassembler::default();
        assert_eq!(reassembler.receive(&messages[0]).unwrap(), Some(data));
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_message_count() {
        let fragmenter = Fragmenter::new(40, 16).unwrap();
        assert_eq!(fragmenter.message_count(40), 1);
        assert_eq!(fragmenter.message_count(41), 3);
        assert_eq!(fragmenter.message_count(48), 3);
        assert_eq!(fragmenter.message_count(49), 4);
        assert_eq!(fragmenter.fragment(&packet(49)).unwrap().len(), 4);
    }

    #[test]
    fn test_empty_and_oversized_input() {
        let fragmenter = Fragmenter::default();
        assert!(matches!(
            fragmenter.fragment(&[]),
            Err(SchcError::MalformedInput(_))
        ));
        assert!(matches!(
            fragmenter.fragment(&packet(MTU + 1)),
            Err(SchcError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(Fragmenter::new(40, 0), Err(SchcError::Config(_))));
        assert!(matches!(Fragmenter::new(40, 239), Err(SchcError::Config(_))));
        assert!(matches!(Fragmenter::new(243, 40), Err(SchcError::Config(_))));
        assert!(Fragmenter::new(242, 238).is_ok());
    }

    // =========================================================================
    // Reassembler tests
    // =========================================================================

    #[test]
    fn test_non_fragment_passes_through() {
        let mut reassembler = Reassembler::default();
        let message = vec![0x02, 0x12, 0x34];
        assert_eq!(reassembler.receive(&message).unwrap(), Some(message));
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_roundtrip() {
        let fragmenter = Fragmenter::new(40, 24).unwrap();
        let mut reassembler = Reassembler::default();
        let data = packet(200);
        let messages = fragmenter.fragment(&data).unwrap();

        for message in &messages[..messages.len() - 1] {
            assert_eq!(reassembler.receive(message).unwrap(), None);
        }
        let last = messages.last().unwrap();
        assert_eq!(reassembler.receive(last).unwrap(), Some(data));
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_corrupted_fragment_detected() {
        let fragmenter = Fragmenter::default();
        let data = packet(100);
        let mut messages = fragmenter.fragment(&data).unwrap();
        messages[1][10] ^= 0x01;

        let mut reassembler = Reassembler::default();
        assert!(matches!(
            reassemble(&mut reassembler, &messages),
            Err(SchcError::IntegrityMismatch { .. })
        ));
        assert!(reassembler.is_idle());

        // State was reset, a clean retransmission succeeds
        let messages = fragmenter.fragment(&data).unwrap();
        assert_eq!(reassemble(&mut reassembler, &messages).unwrap(), Some(data));
    }

    #[test]
    fn test_short_fragment_resets() {
        let mut reassembler = Reassembler::default();
        reassembler.receive(&[FRAGMENT_RULE_ID, FCN_MORE, 1, 2]).unwrap();
        assert_eq!(reassembler.buffered_len(), 2);

        assert!(matches!(
            reassembler.receive(&[FRAGMENT_RULE_ID, FCN_LAST, 0x00]),
            Err(SchcError::MalformedInput(_))
        ));
        assert!(reassembler.is_idle());
        assert!(matches!(
            reassembler.receive(&[FRAGMENT_RULE_ID]),
            Err(SchcError::MalformedInput(_))
        ));
        assert!(matches!(
            reassembler.receive(&[]),
            Err(SchcError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_capacity_exhausted() {
        let mut reassembler = Reassembler::with_capacity(None, 8);
        reassembler.receive(&[FRAGMENT_RULE_ID, FCN_MORE, 1, 2, 3, 4, 5]).unwrap();
        assert!(matches!(
            reassembler.receive(&[FRAGMENT_RULE_ID, FCN_MORE, 6, 7, 8, 9]),
            Err(SchcError::ResourceExhausted(_))
        ));
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_ttl_evicts_stale_packet() {
        let fragmenter = Fragmenter::default();
        let data = packet(100);
        let messages = fragmenter.fragment(&data).unwrap();
        let mut reassembler = Reassembler::new(Some(Duration::from_secs(60)));
        let start = Instant::now();

        assert_eq!(reassembler.receive_at(&messages[0], start).unwrap(), None);
        assert!(!reassembler.expire(start + Duration::from_secs(60)));

        // The stale first fragment is dropped; the new one starts over
        let later = start + Duration::from_secs(61);
        assert_eq!(reassembler.receive_at(&messages[0], later).unwrap(), None);
        assert_eq!(reassembler.evictions(), 1);
        assert_eq!(reassembler.buffered_len(), 40);

        assert_eq!(reassembler.receive_at(&messages[1], later).unwrap(), None);
        assert_eq!(
            reassembler.receive_at(&messages[2], later).unwrap(),
            Some(data)
        );
    }

    #[test]
    fn test_expire_poll() {
        let mut reassembler = Reassembler::new(Some(Duration::from_millis(10)));
        let start = Instant::now();
        reassembler.receive_at(&[FRAGMENT_RULE_ID, FCN_MORE, 1], start).unwrap();

        assert!(reassembler.expire(start + Duration::from_millis(11)));
        assert!(reassembler.is_idle());
        assert!(!reassembler.expire(start + Duration::from_secs(1)));
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let mut reassembler = Reassembler::new(None);
        let start = Instant::now();
        reassembler.receive_at(&[FRAGMENT_RULE_ID, FCN_MORE, 1], start).unwrap();
        assert!(!reassembler.expire(start + Duration::from_secs(3600)));
        assert_eq!(reassembler.buffered_len(), 1);
    }
}
