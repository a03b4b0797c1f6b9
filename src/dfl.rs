// NFB Peer-to-Peer DMA Tooling
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device Feature List (DFL) discovery.
//!
//! A DFL is a chain of self-describing 64-bit headers starting at offset 0
//! of a BAR. Each header carries its kind, an id and the byte distance to
//! the next header. Container headers (FIU) of the FME sub-kind point to
//! further chains, one per implemented port, possibly in other BARs.
//!
//! # Header layout
//!
//! | Bits    | Field         |
//! |---------|---------------|
//! | [0,12)  | id            |
//! | [16,40) | next offset   |
//! | 40      | end of list   |
//! | [52,60) | version       |
//! | [60,64) | type          |
//!
//! Traversal uses an explicit stack of `(bar, offset)` cursors rather than
//! recursion, so the per-BAR hop bound and cycle detection hold regardless
//! of how deeply port chains nest. Port chains are walked before the rest
//! of the chain that referenced them. A chain that reaches a header another
//! branch already walked stops there; only reaching its own headers, or
//! those of the chains that led to it, is a loop.

use crate::access::RegisterAccess;
use crate::error::{P2pError, P2pResult};
use std::collections::{BTreeMap, HashMap};

/// Header type code of an Accelerated Function Unit.
pub const DFH_TYPE_AFU: u8 = 1;
/// Header type code of a private feature.
pub const DFH_TYPE_PRIVATE: u8 = 3;
/// Header type code of a Feature Interface Unit (container).
pub const DFH_TYPE_FIU: u8 = 4;

/// FIU id of the FPGA Management Engine.
pub const FIU_ID_FME: u16 = 0;
/// FIU id of a port.
pub const FIU_ID_PORT: u16 = 1;

/// Synthetic feature id reported for FIU headers.
pub const FEATURE_ID_FIU_HEADER: u16 = 0xfe;
/// Synthetic feature id reported for AFU headers.
pub const FEATURE_ID_AFU: u16 = 0xff;

/// Offset of the GUID words from the header.
pub const GUID_OFFSET: u64 = 0x08;
/// Offset of the FME capability word from the FME header.
pub const FME_HDR_CAP: u64 = 0x30;
/// Offset of the first FME port descriptor from the FME header.
///
/// Port offset registers follow the capability word, as in the standard DFL
/// FME register layout (`PORT0_OFFSET` at 0x38).
pub const FME_HDR_PORT_OFST: u64 = 0x38;

/// Default bound on headers visited per BAR.
pub const DEFAULT_MAX_HOPS: usize = 4096;

/// Number of BAR indices a port descriptor can address.
const MAX_BARS: usize = 8;

/// Test bit `bit` of `value`.
#[inline]
pub const fn bit_get(value: u64, bit: u32) -> bool {
    (value >> bit) & 1 == 1
}

#[inline]
const fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Extract bits `[low, high)` of `value`.
#[inline]
pub const fn field_get(value: u64, high: u32, low: u32) -> u64 {
    (value >> low) & mask(high - low)
}

/// Place `field` into bits `[low, high)`, truncating it to the field width.
#[inline]
pub const fn field_prep(field: u64, high: u32, low: u32) -> u64 {
    (field & mask(high - low)) << low
}

/// Kind of a feature header, from its 4-bit type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderKind {
    /// Accelerated Function Unit; not recorded.
    Afu,
    /// Private feature; recorded by id.
    Private,
    /// Feature Interface Unit; a container (FME or PORT).
    Fiu,
    /// Any other type code.
    Unknown(u8),
}

impl HeaderKind {
    pub const fn from_type(code: u8) -> Self {
        match code {
            DFH_TYPE_AFU => Self::Afu,
            DFH_TYPE_PRIVATE => Self::Private,
            DFH_TYPE_FIU => Self::Fiu,
            other => Self::Unknown(other),
        }
    }

    pub const fn type_code(self) -> u8 {
        match self {
            Self::Afu => DFH_TYPE_AFU,
            Self::Private => DFH_TYPE_PRIVATE,
            Self::Fiu => DFH_TYPE_FIU,
            Self::Unknown(code) => code,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Afu => "AFU",
            Self::Private => "PRIV",
            Self::Fiu => "FIU",
            Self::Unknown(_) => "Unknown",
        }
    }
}

/// One decoded feature header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureHeader {
    pub id: u16,
    pub kind: HeaderKind,
    pub version: u8,
    pub next_offset: u32,
    pub end_of_list: bool,
}

impl FeatureHeader {
    pub const ID: (u32, u32) = (12, 0);
    pub const NEXT: (u32, u32) = (40, 16);
    pub const EOL_BIT: u32 = 40;
    pub const VERSION: (u32, u32) = (60, 52);
    pub const TYPE: (u32, u32) = (64, 60);

    /// Decode a header word.
    pub const fn decode(word: u64) -> Self {
        Self {
            id: field_get(word, Self::ID.0, Self::ID.1) as u16,
            kind: HeaderKind::from_type(field_get(word, Self::TYPE.0, Self::TYPE.1) as u8),
            version: field_get(word, Self::VERSION.0, Self::VERSION.1) as u8,
            next_offset: field_get(word, Self::NEXT.0, Self::NEXT.1) as u32,
            end_of_list: bit_get(word, Self::EOL_BIT),
        }
    }

    /// Encode into a header word. Fields wider than their slot are truncated.
    pub const fn encode(&self) -> u64 {
        field_prep(self.id as u64, Self::ID.0, Self::ID.1)
            | field_prep(self.kind.type_code() as u64, Self::TYPE.0, Self::TYPE.1)
            | field_prep(self.version as u64, Self::VERSION.0, Self::VERSION.1)
            | field_prep(self.next_offset as u64, Self::NEXT.0, Self::NEXT.1)
            | ((self.end_of_list as u64) << Self::EOL_BIT)
    }

    /// Feature id this header is known by: FIU and AFU headers map to
    /// synthetic ids, private features to their own id.
    pub const fn feature_id(&self) -> u16 {
        match self.kind {
            HeaderKind::Fiu => FEATURE_ID_FIU_HEADER,
            HeaderKind::Afu => FEATURE_ID_AFU,
            HeaderKind::Private | HeaderKind::Unknown(_) => self.id,
        }
    }

    /// Whether traversal stops after this header.
    pub const fn is_last(&self) -> bool {
        self.end_of_list || self.next_offset == 0
    }
}

/// 128-bit feature GUID, as four 32-bit words in register order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub [u32; 4]);

impl Guid {
    /// GUID of the FPGA Management Engine.
    pub const FME: Guid = Guid([0xf9e17764, 0x82fe38f0, 0x4a5246e3, 0xbfaf2ae9]);

    /// Read the GUID that follows the header at `offset`.
    pub fn read(bar: &dyn RegisterAccess, offset: u64) -> P2pResult<Self> {
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = bar.read_u32(offset + GUID_OFFSET + 4 * i as u64)?;
        }
        Ok(Self(words))
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [w0, w1, w2, w3] = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:04x}{:08x}",
            w3,
            w2 >> 16,
            w2 & 0xffff,
            w1 >> 16,
            w1 & 0xffff,
            w0
        )
    }
}

/// Port count field of the FME capability word.
#[inline]
pub const fn fme_port_count(cap: u64) -> u8 {
    field_get(cap, 20, 17) as u8
}

/// One FME port descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FmePort {
    pub index: u8,
    pub implemented: bool,
    /// Offset of the port's feature chain within `bar`.
    pub offset: u64,
    pub bar: u8,
}

impl FmePort {
    pub const OFFSET: (u32, u32) = (24, 0);
    pub const BAR: (u32, u32) = (35, 32);
    pub const IMPLEMENTED_BIT: u32 = 60;

    pub const fn decode(index: u8, word: u64) -> Self {
        Self {
            index,
            implemented: bit_get(word, Self::IMPLEMENTED_BIT),
            offset: field_get(word, Self::OFFSET.0, Self::OFFSET.1),
            bar: field_get(word, Self::BAR.0, Self::BAR.1) as u8,
        }
    }

    pub const fn encode(&self) -> u64 {
        field_prep(self.offset, Self::OFFSET.0, Self::OFFSET.1)
            | field_prep(self.bar as u64, Self::BAR.0, Self::BAR.1)
            | ((self.implemented as u64) << Self::IMPLEMENTED_BIT)
    }
}

/// Where a private feature was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureLocation {
    pub bar: u8,
    pub offset: u64,
    pub next_offset: u32,
}

/// A private feature id seen more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureCollision {
    pub id: u16,
    /// Location that was overwritten.
    pub previous: FeatureLocation,
    /// Location that is kept.
    pub current: FeatureLocation,
}

/// Private features discovered on a device, keyed by feature id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureMap {
    features: BTreeMap<u16, FeatureLocation>,
    collisions: Vec<FeatureCollision>,
}

impl FeatureMap {
    pub fn get(&self, id: u16) -> Option<&FeatureLocation> {
        self.features.get(&id)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.features.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Features in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &FeatureLocation)> {
        self.features.iter().map(|(id, loc)| (*id, loc))
    }

    /// Duplicate ids seen during discovery, in discovery order.
    pub fn collisions(&self) -> &[FeatureCollision] {
        &self.collisions
    }
}

/// Bounds and strictness of a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverOptions {
    /// Maximum headers visited per BAR before the chain is considered corrupt.
    pub max_hops: usize,
    /// Fail on unrecognised header types and unreachable port BARs instead of
    /// skipping them.
    pub strict: bool,
}

impl DiscoverOptions {
    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            strict: false,
        }
    }
}

type CollisionHook<'a> = Box<dyn FnMut(&FeatureCollision) + 'a>;

/// Feature list walker over one or more BARs of a device.
pub struct DflWalker<'a> {
    bars: [Option<&'a dyn RegisterAccess>; MAX_BARS],
    options: DiscoverOptions,
    on_collision: Option<CollisionHook<'a>>,
}

impl<'a> DflWalker<'a> {
    pub fn new(options: DiscoverOptions) -> Self {
        Self {
            bars: [None; MAX_BARS],
            options,
            on_collision: None,
        }
    }

    /// Make BAR `index` reachable for the walk. Indices past 7 are ignored
    /// since no port descriptor can address them.
    pub fn with_bar(mut self, index: u8, bar: &'a dyn RegisterAccess) -> Self {
        if let Some(slot) = self.bars.get_mut(index as usize) {
            *slot = Some(bar);
        }
        self
    }

    /// Call `hook` whenever a private feature id overwrites an earlier one.
    pub fn on_collision(mut self, hook: impl FnMut(&FeatureCollision) + 'a) -> Self {
        self.on_collision = Some(Box::new(hook));
        self
    }

    /// Walk the chain starting at `start_offset` of BAR `bar`.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::CorruptChain`] if:
    /// - more than `max_hops` headers are visited in one BAR
    /// - a chain reaches one of its own headers, or a header of a chain
    ///   that led to it (the walk would loop)
    /// - a header lies outside its BAR
    /// - strict mode is on and a header type is unrecognised or a port
    ///   points into a BAR that was not registered
    pub fn discover(&mut self, bar: u8, start_offset: u64) -> P2pResult<FeatureMap> {
        let mut map = FeatureMap::default();
        let mut stack = vec![Cursor {
            bar,
            offset: start_offset,
            chain: 0,
        }];
        // Parent of each chain; chain 0 is the root.
        let mut parents: Vec<Option<usize>> = vec![None];
        // Header -> chain that walked it.
        let mut walked: HashMap<(u8, u64), usize> = HashMap::new();
        let mut hops = [0usize; MAX_BARS];

        while let Some(Cursor { bar, offset, chain }) = stack.pop() {
            let Some(accessor) = self.bars.get(bar as usize).copied().flatten() else {
                if self.options.strict {
                    return Err(corrupt(bar, offset, "chain points into an unmapped BAR"));
                }
                log::warn!("DFL: skipping chain in unmapped BAR{} at {:#x}", bar, offset);
                continue;
            };

            if let Some(&owner) = walked.get(&(bar, offset)) {
                // Reaching a header of this chain or of a chain that led here
                // would repeat forever. Anything else joins an already walked
                // tail.
                if is_ancestor_or_self(&parents, owner, chain) {
                    return Err(corrupt(bar, offset, "header visited twice, chain loops"));
                }
                log::debug!(
                    "DFL: chain joins already walked header at BAR{} {:#x}",
                    bar,
                    offset
                );
                continue;
            }
            walked.insert((bar, offset), chain);

            hops[bar as usize] += 1;
            if hops[bar as usize] > self.options.max_hops {
                return Err(corrupt(
                    bar,
                    offset,
                    &format!("more than {} headers in one BAR", self.options.max_hops),
                ));
            }

            let word = accessor
                .read_u64(offset)
                .map_err(|e| outside_bar(e, bar, offset))?;
            let header = FeatureHeader::decode(word);

            log::debug!(
                "DFL: BAR{} offset {:#x}: {}, id {:#x}, version {}, next {:#x}, eol {}",
                bar,
                offset,
                header.kind.name(),
                header.id,
                header.version,
                header.next_offset,
                header.end_of_list
            );

            let mut ports = Vec::new();
            match header.kind {
                HeaderKind::Fiu => {
                    ports = self.visit_fiu(accessor, bar, offset, &header)?;
                }
                HeaderKind::Private => {
                    let location = FeatureLocation {
                        bar,
                        offset,
                        next_offset: header.next_offset,
                    };
                    self.record(&mut map, header.id, location);
                }
                HeaderKind::Afu => {}
                HeaderKind::Unknown(code) => {
                    if self.options.strict {
                        return Err(corrupt(
                            bar,
                            offset,
                            &format!("unrecognised header type {}", code),
                        ));
                    }
                    log::warn!(
                        "DFL: skipping header of unknown type {} at BAR{} {:#x}",
                        code,
                        bar,
                        offset
                    );
                }
            }

            if !header.is_last() {
                let next = offset
                    .checked_add(u64::from(header.next_offset))
                    .ok_or_else(|| corrupt(bar, offset, "next offset overflows"))?;
                stack.push(Cursor {
                    bar,
                    offset: next,
                    chain,
                });
            }
            // Pushed last so port chains are walked before the continuation.
            for port in ports.into_iter().rev() {
                parents.push(Some(chain));
                stack.push(Cursor {
                    bar: port.bar,
                    offset: port.offset,
                    chain: parents.len() - 1,
                });
            }
        }

        Ok(map)
    }

    fn visit_fiu(
        &self,
        accessor: &dyn RegisterAccess,
        bar: u8,
        offset: u64,
        header: &FeatureHeader,
    ) -> P2pResult<Vec<FmePort>> {
        let guid = Guid::read(accessor, offset).map_err(|e| outside_bar(e, bar, offset))?;
        log::debug!("DFL: FIU {} GUID {}", header.id, guid);

        match header.id {
            FIU_ID_FME => {
                if guid != Guid::FME {
                    log::debug!("DFL: FME header with non-standard GUID {}", guid);
                }
                let cap = accessor
                    .read_u64(offset + FME_HDR_CAP)
                    .map_err(|e| outside_bar(e, bar, offset))?;
                let count = fme_port_count(cap);
                let mut ports = Vec::new();
                for index in 0..count {
                    let word = accessor
                        .read_u64(offset + FME_HDR_PORT_OFST + 8 * u64::from(index))
                        .map_err(|e| outside_bar(e, bar, offset))?;
                    let port = FmePort::decode(index, word);
                    log::debug!(
                        "DFL: FME port {}: implemented {}, BAR{}, offset {:#x}",
                        port.index,
                        port.implemented,
                        port.bar,
                        port.offset
                    );
                    if port.implemented {
                        ports.push(port);
                    }
                }
                Ok(ports)
            }
            FIU_ID_PORT => {
                log::debug!("DFL: FIU port at BAR{} {:#x}", bar, offset);
                Ok(Vec::new())
            }
            other => {
                log::warn!("DFL: unknown FIU {} at BAR{} {:#x}", other, bar, offset);
                Ok(Vec::new())
            }
        }
    }

    fn record(&mut self, map: &mut FeatureMap, id: u16, location: FeatureLocation) {
        if let Some(previous) = map.features.insert(id, location) {
            let collision = FeatureCollision {
                id,
                previous,
                current: location,
            };
            log::warn!(
                "DFL: feature id {:#x} at BAR{} {:#x} overrides BAR{} {:#x}",
                id,
                location.bar,
                location.offset,
                previous.bar,
                previous.offset
            );
            if let Some(hook) = self.on_collision.as_mut() {
                hook(&collision);
            }
            map.collisions.push(collision);
        }
    }
}

/// Position in the work list and the chain it belongs to.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    bar: u8,
    offset: u64,
    chain: usize,
}

/// Whether `owner` is `chain` or one of its ancestors.
fn is_ancestor_or_self(parents: &[Option<usize>], owner: usize, chain: usize) -> bool {
    let mut current = Some(chain);
    while let Some(c) = current {
        if c == owner {
            return true;
        }
        current = parents.get(c).copied().flatten();
    }
    false
}

/// Walk the feature chain of a single BAR with default options.
///
/// Ports that point into other BARs are skipped; use [`DflWalker`] to make
/// them reachable.
pub fn discover(bar: &dyn RegisterAccess, start_offset: u64) -> P2pResult<FeatureMap> {
    DflWalker::new(DiscoverOptions::default())
        .with_bar(0, bar)
        .discover(0, start_offset)
}

fn corrupt(bar: u8, offset: u64, reason: &str) -> P2pError {
    P2pError::CorruptChain {
        bar,
        offset,
        reason: reason.to_string(),
    }
}

fn outside_bar(err: P2pError, bar: u8, offset: u64) -> P2pError {
    match err {
        P2pError::OutOfRange { .. } => corrupt(bar, offset, "header lies outside the BAR"),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBus;
    use std::cell::RefCell;

    fn private(id: u16, next: u32, eol: bool) -> u64 {
        FeatureHeader {
            id,
            kind: HeaderKind::Private,
            version: 1,
            next_offset: next,
            end_of_list: eol,
        }
        .encode()
    }

    fn header(kind: HeaderKind, id: u16, next: u32, eol: bool) -> u64 {
        FeatureHeader {
            id,
            kind,
            version: 0,
            next_offset: next,
            end_of_list: eol,
        }
        .encode()
    }

    /// Small deterministic generator for property-style sweeps.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn below(&mut self, n: u64) -> u64 {
            self.next() % n
        }
    }

    #[test]
    fn test_field_get_closed_open() {
        assert_eq!(field_get(0xFFFF, 12, 0), 0xFFF);
        assert_eq!(field_get(0xF0, 8, 4), 0xF);
        assert_eq!(field_get(u64::MAX, 64, 60), 0xF);
        assert_eq!(field_get(0x1234, 64, 0), 0x1234);
        assert_eq!(field_prep(0x1F, 4, 0), 0xF);
        assert!(bit_get(1 << 40, 40));
        assert!(!bit_get(1 << 40, 39));
    }

    #[test]
    fn test_decode_id_field() {
        for id in [0u64, 1, 0x7FF, 0xFFF] {
            let h = FeatureHeader::decode(id);
            assert_eq!(h.id as u64, id);
            assert_eq!(h.next_offset, 0);
            assert_eq!(h.kind, HeaderKind::Unknown(0));
        }
        // Bits 12..16 are reserved and must not leak into the id.
        assert_eq!(FeatureHeader::decode(0xF000).id, 0);
    }

    #[test]
    fn test_decode_next_offset_field() {
        for next in [0u64, 1, 0x80_0000, 0xFF_FFFF] {
            let h = FeatureHeader::decode(next << 16);
            assert_eq!(h.next_offset as u64, next);
            assert_eq!(h.id, 0);
            assert!(!h.end_of_list);
        }
    }

    #[test]
    fn test_decode_eol_field() {
        let h = FeatureHeader::decode(1 << 40);
        assert!(h.end_of_list);
        assert_eq!(h.next_offset, 0);
        assert_eq!(h.version, 0);
        assert!(!FeatureHeader::decode(!(1u64 << 40)).end_of_list);
    }

    #[test]
    fn test_decode_version_field() {
        for version in [0u64, 1, 0x80, 0xFF] {
            let h = FeatureHeader::decode(version << 52);
            assert_eq!(h.version as u64, version);
            assert_eq!(h.kind, HeaderKind::Unknown(0));
        }
    }

    #[test]
    fn test_decode_type_field() {
        assert_eq!(FeatureHeader::decode(1 << 60).kind, HeaderKind::Afu);
        assert_eq!(FeatureHeader::decode(3 << 60).kind, HeaderKind::Private);
        assert_eq!(FeatureHeader::decode(4 << 60).kind, HeaderKind::Fiu);
        assert_eq!(FeatureHeader::decode(0xF << 60).kind, HeaderKind::Unknown(0xF));
        assert_eq!(FeatureHeader::decode(0xF << 60).version, 0);
    }

    #[test]
    fn test_header_round_trip_boundaries() {
        let kinds = [
            HeaderKind::Unknown(0),
            HeaderKind::Afu,
            HeaderKind::Private,
            HeaderKind::Fiu,
            HeaderKind::Unknown(0xF),
        ];
        for kind in kinds {
            for id in [0u16, 0xFFF] {
                for version in [0u8, 0xFF] {
                    for next in [0u32, 0xFF_FFFF] {
                        for eol in [false, true] {
                            let h = FeatureHeader {
                                id,
                                kind,
                                version,
                                next_offset: next,
                                end_of_list: eol,
                            };
                            assert_eq!(FeatureHeader::decode(h.encode()), h);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_header_round_trip_sweep() {
        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
        for _ in 0..10_000 {
            let h = FeatureHeader {
                id: rng.below(0x1000) as u16,
                kind: HeaderKind::from_type(rng.below(16) as u8),
                version: rng.below(0x100) as u8,
                next_offset: rng.below(0x100_0000) as u32,
                end_of_list: rng.below(2) == 1,
            };
            assert_eq!(FeatureHeader::decode(h.encode()), h);
        }
    }

    #[test]
    fn test_fme_port_descriptor_fields() {
        let port = FmePort::decode(2, (1 << 60) | (5 << 32) | 0x12_3456);
        assert_eq!(
            port,
            FmePort {
                index: 2,
                implemented: true,
                offset: 0x12_3456,
                bar: 5
            }
        );
        assert!(!FmePort::decode(0, 0xFFFF_FF).implemented);
        assert_eq!(FmePort::decode(1, port.encode()).offset, 0x12_3456);
        assert_eq!(fme_port_count(0b111 << 17), 7);
        assert_eq!(fme_port_count(1 << 20), 0);
    }

    #[test]
    fn test_feature_id_routing() {
        let decode = |w| FeatureHeader::decode(w).feature_id();
        assert_eq!(decode(header(HeaderKind::Fiu, 0, 0, true)), FEATURE_ID_FIU_HEADER);
        assert_eq!(decode(header(HeaderKind::Afu, 3, 0, true)), FEATURE_ID_AFU);
        assert_eq!(decode(private(0x12, 0, true)), 0x12);
    }

    #[test]
    fn test_guid_display() {
        assert_eq!(
            Guid::FME.to_string(),
            "bfaf2ae9-4a52-46e3-82fe-38f0f9e17764"
        );
    }

    #[test]
    fn test_linear_chain() {
        let bus = SimBus::new(0x1000);
        bus.write_u64(0x000, private(0x10, 0x100, false)).unwrap();
        bus.write_u64(0x100, header(HeaderKind::Afu, 0, 0x100, false))
            .unwrap();
        bus.write_u64(0x200, private(0x12, 0x80, true)).unwrap();
        // Past the end-of-list flag, must not be visited.
        bus.write_u64(0x280, private(0x13, 0, true)).unwrap();

        let map = discover(&bus, 0).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.get(0x10),
            Some(&FeatureLocation {
                bar: 0,
                offset: 0,
                next_offset: 0x100
            })
        );
        assert_eq!(map.get(0x12).unwrap().offset, 0x200);
        assert_eq!(map.get(0x12).unwrap().next_offset, 0x80);
        assert!(!map.contains(0x13));
        assert!(map.collisions().is_empty());
    }

    #[test]
    fn test_zero_next_offset_terminates() {
        let bus = SimBus::new(0x100);
        bus.write_u64(0x0, private(0x1, 0, false)).unwrap();
        let map = discover(&bus, 0).unwrap();
        assert_eq!(map.iter().map(|(id, _)| id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_start_offset() {
        let bus = SimBus::new(0x1000);
        bus.write_u64(0x000, private(0x1, 0x400, false)).unwrap();
        bus.write_u64(0x400, private(0x2, 0, true)).unwrap();
        let map = discover(&bus, 0x400).unwrap();
        assert!(!map.contains(0x1));
        assert!(map.contains(0x2));
    }

    fn write_fme(bus: &SimBus, offset: u64, next: u32, ports: &[FmePort]) {
        bus.write_u64(offset, header(HeaderKind::Fiu, FIU_ID_FME, next, next == 0))
            .unwrap();
        for (i, word) in Guid::FME.0.iter().enumerate() {
            bus.write_u32(offset + GUID_OFFSET + 4 * i as u64, *word)
                .unwrap();
        }
        bus.write_u64(offset + FME_HDR_CAP, (ports.len() as u64) << 17)
            .unwrap();
        for (i, port) in ports.iter().enumerate() {
            bus.write_u64(offset + FME_HDR_PORT_OFST + 8 * i as u64, port.encode())
                .unwrap();
        }
    }

    #[test]
    fn test_fme_ports_are_walked_and_outer_chain_continues() {
        let bus = SimBus::new(0x4000);
        let ports = [
            FmePort {
                index: 0,
                implemented: true,
                offset: 0x1000,
                bar: 0,
            },
            FmePort {
                index: 1,
                implemented: false,
                offset: 0x2000,
                bar: 0,
            },
        ];
        write_fme(&bus, 0x0, 0x100, &ports);
        bus.write_u64(0x100, private(0x20, 0, true)).unwrap();

        // Port 0 chain: a PORT FIU followed by a private feature.
        bus.write_u64(0x1000, header(HeaderKind::Fiu, FIU_ID_PORT, 0x40, false))
            .unwrap();
        bus.write_u64(0x1040, private(0x30, 0, true)).unwrap();

        // Port 1 is not implemented; its chain must be ignored.
        bus.write_u64(0x2000, private(0x40, 0, true)).unwrap();

        let map = discover(&bus, 0).unwrap();
        assert!(map.contains(0x20));
        assert!(map.contains(0x30));
        assert!(!map.contains(0x40));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_fme_port_descriptors_follow_capability_word() {
        let bus = SimBus::new(0x1000);
        bus.write_u64(0x0, header(HeaderKind::Fiu, FIU_ID_FME, 0, true))
            .unwrap();
        bus.write_u64(0x30, 1 << 17).unwrap();
        let port = FmePort {
            index: 0,
            implemented: true,
            offset: 0x400,
            bar: 0,
        };
        bus.write_u64(0x38, port.encode()).unwrap();
        bus.write_u64(0x400, private(0x21, 0, true)).unwrap();

        assert_eq!(FME_HDR_PORT_OFST, FME_HDR_CAP + 8);
        let map = discover(&bus, 0).unwrap();
        assert_eq!(map.get(0x21).unwrap().offset, 0x400);
    }

    #[test]
    fn test_port_in_other_bar() {
        let bar0 = SimBus::new(0x1000);
        let bar2 = SimBus::new(0x1000);
        write_fme(
            &bar0,
            0x0,
            0,
            &[FmePort {
                index: 0,
                implemented: true,
                offset: 0x200,
                bar: 2,
            }],
        );
        bar2.write_u64(0x200, private(0x12, 0, true)).unwrap();

        let map = DflWalker::new(DiscoverOptions::default())
            .with_bar(0, &bar0)
            .with_bar(2, &bar2)
            .discover(0, 0)
            .unwrap();
        assert_eq!(
            map.get(0x12),
            Some(&FeatureLocation {
                bar: 2,
                offset: 0x200,
                next_offset: 0
            })
        );

        // Without BAR2 the port is skipped, or rejected in strict mode.
        assert!(discover(&bar0, 0).unwrap().is_empty());
        let strict = DflWalker::new(DiscoverOptions::default().with_strict(true))
            .with_bar(0, &bar0)
            .discover(0, 0);
        assert!(matches!(strict, Err(P2pError::CorruptChain { bar: 2, .. })));
    }

    #[test]
    fn test_cycle_is_corrupt() {
        // Port pointing back into the chain that contains the FME.
        let bus = SimBus::new(0x1000);
        bus.write_u64(0x000, private(0x1, 0x100, false)).unwrap();
        write_fme(
            &bus,
            0x100,
            0,
            &[FmePort {
                index: 0,
                implemented: true,
                offset: 0x000,
                bar: 0,
            }],
        );
        assert!(matches!(
            discover(&bus, 0),
            Err(P2pError::CorruptChain { offset: 0, .. })
        ));

        // FME port that points at the FME itself.
        let bus = SimBus::new(0x1000);
        write_fme(
            &bus,
            0x0,
            0,
            &[FmePort {
                index: 0,
                implemented: true,
                offset: 0x0,
                bar: 0,
            }],
        );
        assert!(matches!(
            discover(&bus, 0),
            Err(P2pError::CorruptChain { offset: 0, .. })
        ));
    }

    #[test]
    fn test_converging_chains_share_a_tail() {
        // The FME continuation and its port 0 both lead to the PORT FIU.
        let bus = SimBus::new(0x2000);
        write_fme(
            &bus,
            0x0,
            0x1000,
            &[FmePort {
                index: 0,
                implemented: true,
                offset: 0x1000,
                bar: 0,
            }],
        );
        bus.write_u64(0x1000, header(HeaderKind::Fiu, FIU_ID_PORT, 0x30, false))
            .unwrap();
        bus.write_u64(0x1030, private(0x30, 0, true)).unwrap();

        let map = discover(&bus, 0).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(0x30).unwrap().offset, 0x1030);
        assert!(map.collisions().is_empty());
    }

    #[test]
    fn test_sibling_ports_share_a_chain() {
        let bus = SimBus::new(0x2000);
        let port = |index, offset| FmePort {
            index,
            implemented: true,
            offset,
            bar: 0,
        };
        write_fme(&bus, 0x0, 0, &[port(0, 0x1000), port(1, 0x1040)]);
        bus.write_u64(0x1000, private(0x1, 0x40, false)).unwrap();
        bus.write_u64(0x1040, private(0x2, 0, true)).unwrap();

        let map = discover(&bus, 0).unwrap();
        assert!(map.contains(0x1));
        assert!(map.contains(0x2));
        assert!(map.collisions().is_empty());
    }

    #[test]
    fn test_hop_bound() {
        let bus = SimBus::new(0x1000);
        for i in 0..16u64 {
            let last = i == 15;
            bus.write_u64(i * 0x10, private(i as u16, if last { 0 } else { 0x10 }, last))
                .unwrap();
        }
        let opts = DiscoverOptions::default().with_max_hops(16);
        assert_eq!(
            DflWalker::new(opts).with_bar(0, &bus).discover(0, 0).unwrap().len(),
            16
        );

        let opts = DiscoverOptions::default().with_max_hops(15);
        let err = DflWalker::new(opts).with_bar(0, &bus).discover(0, 0);
        assert!(matches!(err, Err(P2pError::CorruptChain { offset: 0xF0, .. })));
    }

    #[test]
    fn test_chain_running_off_the_bar() {
        let bus = SimBus::new(0x100);
        bus.write_u64(0x0, private(0x1, 0x200, false)).unwrap();
        assert!(matches!(
            discover(&bus, 0),
            Err(P2pError::CorruptChain { offset: 0x200, .. })
        ));
    }

    #[test]
    fn test_unknown_type_strict_and_permissive() {
        let bus = SimBus::new(0x1000);
        bus.write_u64(0x0, header(HeaderKind::Unknown(7), 0x5, 0x40, false))
            .unwrap();
        bus.write_u64(0x40, private(0x6, 0, true)).unwrap();

        let map = discover(&bus, 0).unwrap();
        assert!(!map.contains(0x5));
        assert!(map.contains(0x6));

        let strict = DflWalker::new(DiscoverOptions::default().with_strict(true))
            .with_bar(0, &bus)
            .discover(0, 0);
        assert!(matches!(
            strict,
            Err(P2pError::CorruptChain { offset: 0, ref reason, .. }) if reason.contains("type 7")
        ));
    }

    #[test]
    fn test_duplicate_id_last_write_wins_and_is_reported() {
        let bus = SimBus::new(0x1000);
        bus.write_u64(0x000, private(0x12, 0x100, false)).unwrap();
        bus.write_u64(0x100, private(0x12, 0, true)).unwrap();

        let seen = RefCell::new(Vec::new());
        let map = DflWalker::new(DiscoverOptions::default())
            .with_bar(0, &bus)
            .on_collision(|c| seen.borrow_mut().push(*c))
            .discover(0, 0)
            .unwrap();

        assert_eq!(map.get(0x12).unwrap().offset, 0x100);
        assert_eq!(map.collisions().len(), 1);
        assert_eq!(map.collisions()[0].previous.offset, 0x000);
        assert_eq!(seen.borrow().as_slice(), map.collisions());
    }

    #[test]
    fn test_random_well_formed_chains() {
        const PORT_AREA: u64 = 0x8_0000;
        const PORT_STRIDE: u64 = 0x100;

        let mut rng = XorShift(0xDEAD_BEEF_0BAD_CAFE);
        for _ in 0..200 {
            let len = 1 + rng.below(32) as usize;
            let bus = SimBus::new(0x10_0000);
            let mut expected = BTreeMap::new();
            let mut offset = 0u64;
            let mut sub_chains = 0u64;
            let use_eol = rng.below(2) == 1;

            for i in 0..len {
                let last = i + 1 == len;
                let kind = match rng.below(4) {
                    0 => HeaderKind::Afu,
                    1 => HeaderKind::Private,
                    _ => HeaderKind::Fiu,
                };
                let fme = kind == HeaderKind::Fiu && rng.below(2) == 1;
                // An FME needs room for its capability and port words.
                let min_next = if fme { 0x80 } else { 0x20 };
                let next = if last && !use_eol {
                    0
                } else {
                    min_next + 8 * rng.below(0x100) as u32
                };
                let id = match kind {
                    HeaderKind::Fiu if fme => FIU_ID_FME,
                    HeaderKind::Fiu => FIU_ID_PORT,
                    _ => rng.below(16) as u16,
                };
                bus.write_u64(offset, header(kind, id, next, last && use_eol))
                    .unwrap();

                if fme {
                    let ports = rng.below(8);
                    bus.write_u64(offset + FME_HDR_CAP, ports << 17).unwrap();
                    for p in 0..ports {
                        let base = PORT_AREA + sub_chains * PORT_STRIDE;
                        let implemented = rng.below(3) != 0;
                        let port = FmePort {
                            index: p as u8,
                            implemented,
                            offset: base,
                            bar: 0,
                        };
                        bus.write_u64(offset + FME_HDR_PORT_OFST + 8 * p, port.encode())
                            .unwrap();

                        // Sub-chain ids never clash with the outer chain or
                        // with each other.
                        let sub_len = 1 + rng.below(4);
                        for j in 0..sub_len {
                            let sub_last = j + 1 == sub_len;
                            let sub_id = (0x100 + sub_chains * 4 + j) as u16;
                            let sub_next = if sub_last { 0 } else { 0x40 };
                            let sub_offset = base + j * 0x40;
                            bus.write_u64(sub_offset, private(sub_id, sub_next, sub_last))
                                .unwrap();
                            if implemented {
                                expected.insert(
                                    sub_id,
                                    FeatureLocation {
                                        bar: 0,
                                        offset: sub_offset,
                                        next_offset: sub_next,
                                    },
                                );
                            }
                        }
                        sub_chains += 1;
                    }
                }

                if kind == HeaderKind::Private {
                    expected.insert(
                        id,
                        FeatureLocation {
                            bar: 0,
                            offset,
                            next_offset: next,
                        },
                    );
                }
                offset += u64::from(next);
            }

            let map = discover(&bus, 0).unwrap();
            let found: BTreeMap<u16, FeatureLocation> =
                map.iter().map(|(id, loc)| (id, *loc)).collect();
            assert_eq!(found, expected);
        }
    }
}
