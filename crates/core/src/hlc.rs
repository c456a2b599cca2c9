use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::CoreError;

/// Remote stamps further ahead of local wall time than this are not absorbed.
pub const MAX_DRIFT_MS: u64 = 5 * 60 * 1000;

pub fn physical_now() -> Result<u64, CoreError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| CoreError::InvalidData("system clock before epoch".into()))
}

/// Row timestamp: wall milliseconds plus a logical counter.
///
/// Every `created_at` / `updated_at` in the store and every sync cursor is an
/// `Hlc`. It is persisted as a 12-byte big-endian blob (wall, then counter), so
/// SQLite's blob comparison agrees with the derived `Ord`.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Hlc {
    wall_ms: u64,
    counter: u32,
}

impl Hlc {
    pub const ZERO: Hlc = Hlc { wall_ms: 0, counter: 0 };

    pub const fn new(wall_ms: u64, counter: u32) -> Self {
        Self { wall_ms, counter }
    }

    pub fn wall_ms(&self) -> u64 {
        self.wall_ms
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn to_bytes(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        let (wall, counter) = out.split_at_mut(8);
        wall.copy_from_slice(&self.wall_ms.to_be_bytes());
        counter.copy_from_slice(&self.counter.to_be_bytes());
        out
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
        let (wall, counter) = match bytes.len() {
            12 => bytes.split_at(8),
            n => return Err(CoreError::InvalidData(format!("timestamp blob is {n} bytes, want 12"))),
        };
        let wall: [u8; 8] = wall.try_into().map_err(|_| CoreError::InvalidData("timestamp wall".into()))?;
        let counter: [u8; 4] =
            counter.try_into().map_err(|_| CoreError::InvalidData("timestamp counter".into()))?;
        Ok(Self::new(u64::from_be_bytes(wall), u32::from_be_bytes(counter)))
    }

    /// The smallest stamp strictly after `self`, given the wall time `now`.
    fn successor(self, now: u64) -> Result<Hlc, CoreError> {
        if now > self.wall_ms {
            return Ok(Hlc::new(now, 0));
        }
        let counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| CoreError::InvalidData(format!("timestamp counter exhausted at {self}")))?;
        Ok(Hlc::new(self.wall_ms, counter))
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.wall_ms, self.counter)
    }
}

impl Serialize for Hlc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Hlc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        Hlc::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Issues strictly increasing stamps for one local store.
#[derive(Debug, Default)]
pub struct HlcClock {
    last: Hlc,
}

impl HlcClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after the newest stamp already persisted, so a wall clock that
    /// stepped backwards across a restart still produces newer rows.
    pub fn starting_after(last: Hlc) -> Self {
        Self { last }
    }

    pub fn last(&self) -> Hlc {
        self.last
    }

    pub fn tick(&mut self) -> Result<Hlc, CoreError> {
        self.last = self.last.successor(physical_now()?)?;
        Ok(self.last)
    }

    /// Like `tick`, but also strictly after `floor`. Used when a local edit
    /// must outrank a row already stored, whatever the drift limit says.
    pub fn tick_after(&mut self, floor: Hlc) -> Result<Hlc, CoreError> {
        self.last = self.last.max(floor).successor(physical_now()?)?;
        Ok(self.last)
    }

    /// Absorb a stamp observed from the backend. Later ticks sort after it.
    pub fn receive(&mut self, remote: &Hlc) -> Result<Hlc, CoreError> {
        let now = physical_now()?;
        if remote.wall_ms > now.saturating_add(MAX_DRIFT_MS) {
            return Err(CoreError::HlcDriftTooLarge {
                delta_ms: remote.wall_ms - now,
                max_ms: MAX_DRIFT_MS,
            });
        }
        self.last = self.last.max(*remote).successor(now)?;
        Ok(self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_strictly_increase() {
        let mut clock = HlcClock::new();
        let stamps: Vec<Hlc> = (0..200).map(|_| clock.tick().unwrap()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn clock_ahead_of_wall_time_counts_up() {
        let ahead = physical_now().unwrap() + 60_000;
        let mut clock = HlcClock::starting_after(Hlc::new(ahead, 3));

        assert_eq!(clock.tick().unwrap(), Hlc::new(ahead, 4));
        assert_eq!(clock.tick().unwrap(), Hlc::new(ahead, 5));
        assert_eq!(clock.last(), Hlc::new(ahead, 5));
    }

    #[test]
    fn blob_order_matches_stamp_order() {
        let ordered = [Hlc::ZERO, Hlc::new(0, 1), Hlc::new(100, 0), Hlc::new(100, 999), Hlc::new(101, 0)];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].to_bytes() < pair[1].to_bytes());
        }
        let stamp = Hlc::new(1_700_000_000_123, 42);
        assert_eq!(Hlc::from_slice(&stamp.to_bytes()).unwrap(), stamp);
    }

    #[test]
    fn malformed_blob_is_rejected() {
        assert!(matches!(Hlc::from_slice(&[0u8; 11]), Err(CoreError::InvalidData(_))));
        assert!(Hlc::from_slice(&[0u8; 13]).is_err());
    }

    #[test]
    fn exhausted_counter_is_an_error() {
        let ahead = physical_now().unwrap() + 60_000;
        let mut clock = HlcClock::starting_after(Hlc::new(ahead, u32::MAX));
        assert!(clock.tick().is_err());
    }

    #[test]
    fn tick_after_outranks_a_far_future_floor() {
        let mut clock = HlcClock::new();
        let floor = Hlc::new(physical_now().unwrap() + MAX_DRIFT_MS * 2, 4);
        let stamp = clock.tick_after(floor).unwrap();
        assert_eq!(stamp, Hlc::new(floor.wall_ms(), 5));
        assert!(clock.tick().unwrap() > floor);
    }

    #[test]
    fn far_future_remote_is_not_absorbed() {
        let mut clock = HlcClock::new();
        let before = clock.tick().unwrap();
        let remote = Hlc::new(physical_now().unwrap() + MAX_DRIFT_MS + 10_000, 0);

        let err = clock.receive(&remote).unwrap_err();
        assert!(matches!(err, CoreError::HlcDriftTooLarge { max_ms: MAX_DRIFT_MS, .. }));
        assert_eq!(clock.last(), before);
    }

    #[test]
    fn local_edits_after_a_pull_sort_after_remote_rows() {
        let mut clock = HlcClock::new();
        let local = clock.tick().unwrap();
        let remote = Hlc::new(local.wall_ms() + 30_000, 7);

        let merged = clock.receive(&remote).unwrap();
        assert_eq!(merged, Hlc::new(remote.wall_ms(), 8));
        assert!(clock.tick().unwrap() > remote);
    }
}
