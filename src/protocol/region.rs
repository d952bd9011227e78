//! Keys, key ranges and region maps.
//!
//! A region in this engine *is* a key range: a contiguous span of the
//! lexicographic key order. Ranges are normalized at construction to the
//! half-open form `[left, right)` (with an optionally unbounded right edge),
//! which makes shard pieces concatenate without overlap. A `RegionMap<V>`
//! is a total function over a domain range, represented as a sorted,
//! disjoint, contiguous partition each piece of which carries a `V`.

use std::fmt;

use crate::protocol::buffer::{read_bool, read_bytes, write_bool, write_bytes};
use crate::protocol::{DecodeError, ProtocolError};

/// Maximum length of a stored key in bytes.
pub const MAX_KEY_SIZE: usize = 250;

/// An opaque byte-string key, ordered lexicographically.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey(Vec<u8>);

impl StoreKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        debug_assert!(bytes.len() <= MAX_KEY_SIZE, "key exceeds {} bytes", MAX_KEY_SIZE);
        Self(bytes)
    }

    /// The minimum key: the empty byte string.
    pub fn min() -> Self {
        Self(Vec::new())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The immediate lexicographic successor. Only used as an exclusive
    /// range bound, so it may exceed `MAX_KEY_SIZE`.
    pub fn successor(&self) -> StoreKey {
        let mut bytes = self.0.clone();
        bytes.push(0);
        StoreKey(bytes)
    }
}

impl From<&[u8]> for StoreKey {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl From<&str> for StoreKey {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"")?;
        for &b in &self.0 {
            if (b' '..=b'~').contains(&b) && b != b'"' && b != b'\\' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        write!(f, "\"")
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// How an rget bound is interpreted: absent, exclusive or inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundMode {
    None,
    Open,
    Closed,
}

/// The right edge of a normalized range: an exclusive key, or unbounded
/// ("to the maximum key").
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RightBound {
    Bounded(StoreKey),
    Unbounded,
}

impl fmt::Debug for RightBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RightBound::Bounded(k) => write!(f, "{}", k),
            RightBound::Unbounded => write!(f, "+inf"),
        }
    }
}

/// A contiguous span of the key order, normalized to `[left, right)`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    left: StoreKey,
    right: RightBound,
}

impl KeyRange {
    /// Builds a range from rget-style bound modes, normalizing to the
    /// half-open form: a `Closed` left keeps the key, an `Open` left starts
    /// at its successor, `None` starts at the minimum key; an `Open` right
    /// excludes the key, a `Closed` right ends at its successor, `None` is
    /// unbounded.
    pub fn new(
        left_mode: BoundMode,
        left_key: &StoreKey,
        right_mode: BoundMode,
        right_key: &StoreKey,
    ) -> Self {
        let left = match left_mode {
            BoundMode::None => StoreKey::min(),
            BoundMode::Closed => left_key.clone(),
            BoundMode::Open => left_key.successor(),
        };
        let right = match right_mode {
            BoundMode::None => RightBound::Unbounded,
            BoundMode::Open => RightBound::Bounded(right_key.clone()),
            BoundMode::Closed => RightBound::Bounded(right_key.successor()),
        };
        Self { left, right }
    }

    /// The range spanning every key.
    pub fn universe() -> Self {
        Self {
            left: StoreKey::min(),
            right: RightBound::Unbounded,
        }
    }

    /// The range containing exactly `key`.
    pub fn point(key: &StoreKey) -> Self {
        Self {
            left: key.clone(),
            right: RightBound::Bounded(key.successor()),
        }
    }

    pub fn from_bounds(left: StoreKey, right: RightBound) -> Self {
        Self { left, right }
    }

    pub fn left(&self) -> &StoreKey {
        &self.left
    }

    pub fn right(&self) -> &RightBound {
        &self.right
    }

    pub fn is_empty(&self) -> bool {
        match &self.right {
            RightBound::Bounded(right) => *right <= self.left,
            RightBound::Unbounded => false,
        }
    }

    pub fn is_universe(&self) -> bool {
        self.left.is_empty() && self.right == RightBound::Unbounded
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        if key < self.left.as_slice() {
            return false;
        }
        match &self.right {
            RightBound::Bounded(right) => key < right.as_slice(),
            RightBound::Unbounded => true,
        }
    }

    pub fn is_superset(&self, sub: &KeyRange) -> bool {
        if sub.is_empty() {
            return true;
        }
        if sub.left < self.left {
            return false;
        }
        match (&self.right, &sub.right) {
            (RightBound::Unbounded, _) => true,
            (RightBound::Bounded(_), RightBound::Unbounded) => false,
            (RightBound::Bounded(own), RightBound::Bounded(other)) => other <= own,
        }
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        !self.intersection(other).is_empty()
    }

    /// The (possibly empty) common span of two ranges.
    pub fn intersection(&self, other: &KeyRange) -> KeyRange {
        // A bounded right edge orders below the unbounded one, so the
        // derived ordering picks the tighter of the two.
        let left = self.left.clone().max(other.left.clone());
        let right = self.right.clone().min(other.right.clone());
        KeyRange { left, right }
    }

    /// The pieces of `self` not covered by `other`, in key order. At most
    /// two: the span left of `other` and the span right of it.
    pub fn subtract(&self, other: &KeyRange) -> Vec<KeyRange> {
        let cut = self.intersection(other);
        if cut.is_empty() {
            return vec![self.clone()];
        }
        let mut pieces = Vec::new();
        let before = KeyRange {
            left: self.left.clone(),
            right: RightBound::Bounded(cut.left.clone()),
        };
        if !before.is_empty() {
            pieces.push(before);
        }
        if let RightBound::Bounded(cut_right) = &cut.right {
            let after = KeyRange {
                left: cut_right.clone(),
                right: self.right.clone(),
            };
            if !after.is_empty() {
                pieces.push(after);
            }
        }
        pieces
    }

    /// Serializes with the shared framing codec: the left key, an
    /// unbounded flag, and the right key when bounded.
    pub fn encode(&self, out: &mut Vec<u8>) {
        write_bytes(out, self.left.as_slice());
        match &self.right {
            RightBound::Unbounded => write_bool(out, true),
            RightBound::Bounded(right) => {
                write_bool(out, false);
                write_bytes(out, right.as_slice());
            }
        }
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let left = StoreKey(read_bytes(input)?);
        let right = if read_bool(input)? {
            RightBound::Unbounded
        } else {
            RightBound::Bounded(StoreKey(read_bytes(input)?))
        };
        Ok(Self { left, right })
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.right {
            RightBound::Bounded(right) => write!(f, "[{}, {})", self.left, right),
            RightBound::Unbounded => write!(f, "[{}, +inf)", self.left),
        }
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A total function over a domain range: a sorted, disjoint, contiguous
/// partition of the domain, each piece carrying a value.
#[derive(Clone, Debug)]
pub struct RegionMap<V> {
    entries: Vec<(KeyRange, V)>,
}

impl<V> RegionMap<V> {
    /// A map assigning one value to an entire domain.
    pub fn new(domain: KeyRange, value: V) -> Self {
        debug_assert!(!domain.is_empty());
        Self {
            entries: vec![(domain, value)],
        }
    }

    /// Builds a map from arbitrary pieces, validating that they tile a
    /// contiguous domain with no gaps or overlaps. Empty pieces are
    /// dropped.
    pub fn from_pairs(pairs: Vec<(KeyRange, V)>) -> Result<Self, ProtocolError> {
        let mut entries: Vec<(KeyRange, V)> =
            pairs.into_iter().filter(|(r, _)| !r.is_empty()).collect();
        if entries.is_empty() {
            return Err(ProtocolError::NotAPartition("no non-empty regions".into()));
        }
        entries.sort_by(|a, b| a.0.left.cmp(&b.0.left));
        for window in entries.windows(2) {
            let (prev, next) = (&window[0].0, &window[1].0);
            match &prev.right {
                RightBound::Unbounded => {
                    return Err(ProtocolError::NotAPartition(format!(
                        "{} overlaps {}",
                        prev, next
                    )));
                }
                RightBound::Bounded(right) => {
                    if *right != next.left {
                        return Err(ProtocolError::NotAPartition(format!(
                            "{} does not abut {}",
                            prev, next
                        )));
                    }
                }
            }
        }
        Ok(Self { entries })
    }

    /// The contiguous range the partition covers.
    pub fn get_domain(&self) -> KeyRange {
        let left = self.entries[0].0.left.clone();
        let right = self.entries[self.entries.len() - 1].0.right.clone();
        KeyRange::from_bounds(left, right)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyRange, &V)> {
        self.entries.iter().map(|(r, v)| (r, v))
    }

    pub fn into_pairs(self) -> Vec<(KeyRange, V)> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Clone> RegionMap<V> {
    /// Restricts the map to `region`, which must lie within the domain.
    pub fn mask(&self, region: &KeyRange) -> Result<RegionMap<V>, ProtocolError> {
        if !self.get_domain().is_superset(region) {
            return Err(ProtocolError::DomainViolation {
                sub: region.clone(),
                parent: self.get_domain(),
            });
        }
        let entries: Vec<(KeyRange, V)> = self
            .entries
            .iter()
            .filter_map(|(r, v)| {
                let cut = r.intersection(region);
                if cut.is_empty() {
                    None
                } else {
                    Some((cut, v.clone()))
                }
            })
            .collect();
        Ok(RegionMap { entries })
    }

    /// Overlays `other` onto `self`. The domain of `other` must lie within
    /// the domain of `self`; the overall domain is unchanged.
    pub fn update(&mut self, other: RegionMap<V>) -> Result<(), ProtocolError> {
        let overlay = other.get_domain();
        if !self.get_domain().is_superset(&overlay) {
            return Err(ProtocolError::DomainViolation {
                sub: overlay,
                parent: self.get_domain(),
            });
        }
        let mut entries: Vec<(KeyRange, V)> = Vec::with_capacity(self.entries.len() + other.len());
        for (r, v) in self.entries.drain(..) {
            for piece in r.subtract(&overlay) {
                entries.push((piece, v.clone()));
            }
        }
        entries.extend(other.entries);
        entries.sort_by(|a, b| a.0.left.cmp(&b.0.left));
        self.entries = entries;
        Ok(())
    }
}

impl<V: PartialEq> RegionMap<V> {
    /// Index pairs of maximal runs of adjacent entries with equal values.
    /// Two partitions of the same domain describe the same total function
    /// iff their coalesced forms agree.
    fn coalesced(&self) -> Vec<(KeyRange, &V)> {
        let mut result: Vec<(KeyRange, &V)> = Vec::new();
        for (range, value) in &self.entries {
            if let Some((last_range, last_value)) = result.last_mut() {
                if *last_value == value && last_range.right == RightBound::Bounded(range.left.clone())
                {
                    last_range.right = range.right.clone();
                    continue;
                }
            }
            result.push((range.clone(), value));
        }
        result
    }
}

impl<V: PartialEq> PartialEq for RegionMap<V> {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.coalesced(), other.coalesced());
        a.len() == b.len()
            && a.iter()
                .zip(b.iter())
                .all(|((ra, va), (rb, vb))| ra == rb && va == vb)
    }
}

impl<V: Eq> Eq for RegionMap<V> {}
