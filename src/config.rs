// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

//! Typed, validated parameter surface exposed through the host's reflection
//! framework.
//!
//! Each parameter is a record `{id, default, supported values, validator}`
//! keyed by a stable [`ParamId`]; the reflection side just iterates the
//! records. Setters validate before applying, and a few of them carry
//! side-effects (heap selection, edge-triggered sync request, drop-list
//! accumulation) that the component workers consume.

use std::collections::HashMap;
use std::path::Path;

use crate::error::C2Error;
use crate::error::C2Result;
use crate::ColorAspects;
use crate::Resolution;

/// C2 memory usage bits relevant to heap selection.
pub const USAGE_CPU_READ: u64 = 1 << 0;
pub const USAGE_CPU_WRITE: u64 = 1 << 1;
pub const USAGE_READ_PROTECTED: u64 = 1 << 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ParamId {
    IonUsage,
    DmaBufUsage,
    PictureSize,
    Bitrate,
    FrameRate,
    ProfileLevel,
    IntraRefresh,
    TemporalLayerCount,
    RequestSyncFrame,
    QpBounds,
    VuiColorAspects,
    HdrStaticInfo,
    LowMemoryMode,
    FbcOutputMode,
    ScalingOutputMode,
    OutputDelay,
    PrependHeaderMode,
    DropFramePts,
}

/// Ion allocator usage hint. The setter forces the heap mask to "all heaps"
/// and clears flags and alignment regardless of what the host asked for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IonUsage {
    pub usage: u64,
    pub capacity: u32,
    pub heap_mask: u32,
    pub alloc_flags: u32,
    pub min_alignment: u32,
}

/// Dma-buf allocator usage hint. The heap name is chosen by the setter, not
/// the host; see [`select_heap_name`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DmaBufUsage {
    pub usage: u64,
    pub capacity: u32,
    pub alloc_flags: u32,
    pub heap_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    U32(u32),
    U64(u64),
    Bool(bool),
    Size { width: u32, height: u32 },
    ProfileLevel { profile: u32, level: u32 },
    QpBounds { min: u32, max: u32 },
    ColorAspects(ColorAspects),
    HdrStaticInfo { max_cll: u32, max_fall: u32 },
    IonUsage(IonUsage),
    DmaBufUsage(DmaBufUsage),
    Pts(Vec<u64>),
}

/// Legal values for a parameter field.
#[derive(Clone, Debug, PartialEq)]
pub enum SupportedValues {
    Any,
    Range { min: u64, max: u64 },
    OneOf(Vec<u64>),
}

impl SupportedValues {
    fn admits(&self, v: u64) -> bool {
        match self {
            SupportedValues::Any => true,
            SupportedValues::Range { min, max } => (*min..=*max).contains(&v),
            SupportedValues::OneOf(set) => set.contains(&v),
        }
    }
}

pub struct ParamRecord {
    pub id: ParamId,
    pub name: &'static str,
    pub default: ParamValue,
    pub supported: SupportedValues,
    validator: fn(&ParamValue, &SupportedValues) -> bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamDescriptor {
    pub id: ParamId,
    pub name: &'static str,
}

/// Which dma-buf heaps the platform offers. Probed once at store creation;
/// injectable for tests.
#[derive(Copy, Clone, Debug, Default)]
pub struct HeapSupport {
    pub secure: bool,
    pub uncached: bool,
}

impl HeapSupport {
    pub fn detect() -> Self {
        Self {
            secure: Path::new("/dev/dma_heap/secure").exists(),
            uncached: Path::new("/dev/dma_heap/system-uncached").exists(),
        }
    }
}

/// Heap choice policy for the dma-buf usage hint.
pub fn select_heap_name(usage: u64, heaps: HeapSupport) -> &'static str {
    if (usage & USAGE_READ_PROTECTED) != 0 && heaps.secure {
        "secure"
    } else if heaps.uncached && (usage & (USAGE_CPU_READ | USAGE_CPU_WRITE)) == 0 {
        "system-uncached"
    } else {
        "system"
    }
}

fn validate_u32(value: &ParamValue, supported: &SupportedValues) -> bool {
    matches!(value, ParamValue::U32(v) if supported.admits(*v as u64))
}

fn validate_bool(value: &ParamValue, _supported: &SupportedValues) -> bool {
    matches!(value, ParamValue::Bool(_))
}

fn validate_size(value: &ParamValue, supported: &SupportedValues) -> bool {
    matches!(value, ParamValue::Size { width, height }
        if supported.admits(*width as u64) && supported.admits(*height as u64))
}

fn validate_profile_level(value: &ParamValue, _supported: &SupportedValues) -> bool {
    matches!(value, ParamValue::ProfileLevel { .. })
}

fn validate_qp_bounds(value: &ParamValue, supported: &SupportedValues) -> bool {
    matches!(value, ParamValue::QpBounds { min, max }
        if min <= max && supported.admits(*min as u64) && supported.admits(*max as u64))
}

fn validate_aspects(value: &ParamValue, _supported: &SupportedValues) -> bool {
    matches!(value, ParamValue::ColorAspects(_))
}

fn validate_hdr_static(value: &ParamValue, _supported: &SupportedValues) -> bool {
    matches!(value, ParamValue::HdrStaticInfo { .. })
}

fn validate_ion(value: &ParamValue, _supported: &SupportedValues) -> bool {
    matches!(value, ParamValue::IonUsage(_))
}

fn validate_dmabuf(value: &ParamValue, _supported: &SupportedValues) -> bool {
    matches!(value, ParamValue::DmaBufUsage(_))
}

fn validate_pts(value: &ParamValue, _supported: &SupportedValues) -> bool {
    matches!(value, ParamValue::Pts(_))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InterfaceKind {
    Store,
    Decoder,
    Encoder,
}

/// Per-component (or store-level) configuration surface.
pub struct ConfigInterface {
    name: String,
    kind: InterfaceKind,
    heaps: HeapSupport,
    records: Vec<ParamRecord>,
    values: HashMap<ParamId, ParamValue>,
    pending_drops: Vec<u64>,
    sync_frame_requested: bool,
}

fn store_records() -> Vec<ParamRecord> {
    vec![
        ParamRecord {
            id: ParamId::IonUsage,
            name: "store.ion-usage",
            default: ParamValue::IonUsage(IonUsage::default()),
            supported: SupportedValues::Any,
            validator: validate_ion,
        },
        ParamRecord {
            id: ParamId::DmaBufUsage,
            name: "store.dmabuf-usage",
            default: ParamValue::DmaBufUsage(DmaBufUsage {
                heap_name: "system".to_string(),
                ..Default::default()
            }),
            supported: SupportedValues::Any,
            validator: validate_dmabuf,
        },
    ]
}

fn decoder_records() -> Vec<ParamRecord> {
    vec![
        ParamRecord {
            id: ParamId::PictureSize,
            name: "coded.picture-size",
            default: ParamValue::Size { width: 320, height: 240 },
            supported: SupportedValues::Range { min: 2, max: 8192 },
            validator: validate_size,
        },
        ParamRecord {
            id: ParamId::VuiColorAspects,
            name: "coded.color-aspects",
            default: ParamValue::ColorAspects(ColorAspects::default()),
            supported: SupportedValues::Any,
            validator: validate_aspects,
        },
        ParamRecord {
            id: ParamId::HdrStaticInfo,
            name: "coded.hdr-static-info",
            default: ParamValue::HdrStaticInfo { max_cll: 0, max_fall: 0 },
            supported: SupportedValues::Any,
            validator: validate_hdr_static,
        },
        ParamRecord {
            id: ParamId::LowMemoryMode,
            name: "vendor.low-memory-mode",
            default: ParamValue::Bool(false),
            supported: SupportedValues::Any,
            validator: validate_bool,
        },
        ParamRecord {
            id: ParamId::FbcOutputMode,
            name: "vendor.fbc-output-mode",
            default: ParamValue::U32(0),
            supported: SupportedValues::OneOf(vec![0, 1, 2]),
            validator: validate_u32,
        },
        ParamRecord {
            id: ParamId::ScalingOutputMode,
            name: "vendor.scaling-output-mode",
            default: ParamValue::U32(0),
            supported: SupportedValues::OneOf(vec![0, 1]),
            validator: validate_u32,
        },
        ParamRecord {
            id: ParamId::OutputDelay,
            name: "output.delay",
            default: ParamValue::U32(4),
            supported: SupportedValues::Range { min: 0, max: 64 },
            validator: validate_u32,
        },
        ParamRecord {
            id: ParamId::DropFramePts,
            name: "vendor.drop-frame-pts",
            default: ParamValue::Pts(vec![]),
            supported: SupportedValues::Any,
            validator: validate_pts,
        },
    ]
}

fn encoder_records() -> Vec<ParamRecord> {
    vec![
        ParamRecord {
            id: ParamId::PictureSize,
            name: "coded.picture-size",
            default: ParamValue::Size { width: 320, height: 240 },
            supported: SupportedValues::Range { min: 2, max: 8192 },
            validator: validate_size,
        },
        ParamRecord {
            id: ParamId::Bitrate,
            name: "coded.bitrate",
            default: ParamValue::U32(64_000),
            supported: SupportedValues::Range { min: 4_096, max: 160_000_000 },
            validator: validate_u32,
        },
        ParamRecord {
            id: ParamId::FrameRate,
            name: "coded.frame-rate",
            default: ParamValue::U32(30),
            supported: SupportedValues::Range { min: 1, max: 240 },
            validator: validate_u32,
        },
        ParamRecord {
            id: ParamId::ProfileLevel,
            name: "coded.profile-level",
            default: ParamValue::ProfileLevel { profile: 0, level: 0 },
            supported: SupportedValues::Any,
            validator: validate_profile_level,
        },
        ParamRecord {
            id: ParamId::IntraRefresh,
            name: "coded.intra-refresh",
            default: ParamValue::U32(0),
            supported: SupportedValues::Range { min: 0, max: 1 << 16 },
            validator: validate_u32,
        },
        ParamRecord {
            id: ParamId::TemporalLayerCount,
            name: "coded.temporal-layer-count",
            default: ParamValue::U32(0),
            supported: SupportedValues::Range { min: 0, max: 4 },
            validator: validate_u32,
        },
        ParamRecord {
            id: ParamId::RequestSyncFrame,
            name: "coded.request-sync-frame",
            default: ParamValue::Bool(false),
            supported: SupportedValues::Any,
            validator: validate_bool,
        },
        ParamRecord {
            id: ParamId::QpBounds,
            name: "coded.qp-bounds",
            default: ParamValue::QpBounds { min: 10, max: 51 },
            supported: SupportedValues::Range { min: 0, max: 51 },
            validator: validate_qp_bounds,
        },
        ParamRecord {
            id: ParamId::VuiColorAspects,
            name: "coded.color-aspects",
            default: ParamValue::ColorAspects(ColorAspects::default()),
            supported: SupportedValues::Any,
            validator: validate_aspects,
        },
        ParamRecord {
            id: ParamId::PrependHeaderMode,
            name: "coded.prepend-header-mode",
            default: ParamValue::Bool(false),
            supported: SupportedValues::Any,
            validator: validate_bool,
        },
    ]
}

impl ConfigInterface {
    pub fn for_store(heaps: HeapSupport) -> Self {
        Self::with_records("c2.rk.vendor.store", InterfaceKind::Store, heaps, store_records())
    }

    pub fn for_decoder(name: &str) -> Self {
        Self::with_records(name, InterfaceKind::Decoder, HeapSupport::default(), decoder_records())
    }

    pub fn for_encoder(name: &str) -> Self {
        Self::with_records(name, InterfaceKind::Encoder, HeapSupport::default(), encoder_records())
    }

    fn with_records(
        name: &str,
        kind: InterfaceKind,
        heaps: HeapSupport,
        records: Vec<ParamRecord>,
    ) -> Self {
        let values = records.iter().map(|r| (r.id, r.default.clone())).collect();
        Self {
            name: name.to_string(),
            kind,
            heaps,
            records,
            values,
            pending_drops: Vec::new(),
            sync_frame_requested: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> InterfaceKind {
        self.kind
    }

    pub fn query(&self, id: ParamId) -> C2Result<ParamValue> {
        self.values.get(&id).cloned().ok_or(C2Error::NotFound)
    }

    pub fn supported_params(&self) -> Vec<ParamDescriptor> {
        self.records.iter().map(|r| ParamDescriptor { id: r.id, name: r.name }).collect()
    }

    pub fn supported_values(&self, id: ParamId) -> C2Result<SupportedValues> {
        self.records
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.supported.clone())
            .ok_or(C2Error::NotFound)
    }

    /// Applies a batch of updates. Valid updates are applied even when
    /// others in the batch fail; any failure surfaces as `BAD_VALUE`.
    /// `may_block` mirrors the host call's blocking allowance; none of the
    /// current appliers need to block.
    pub fn config(&mut self, updates: Vec<(ParamId, ParamValue)>, _may_block: bool) -> C2Result<()> {
        let mut failed = false;
        for (id, value) in updates {
            match self.apply(id, value) {
                Ok(()) => {}
                Err(err) => {
                    log::warn!("{}: rejected config for {:?}: {}", self.name, id, err);
                    failed = true;
                }
            }
        }
        if failed {
            Err(C2Error::BadValue)
        } else {
            Ok(())
        }
    }

    fn apply(&mut self, id: ParamId, value: ParamValue) -> C2Result<()> {
        let record = self.records.iter().find(|r| r.id == id).ok_or(C2Error::NotFound)?;
        if !(record.validator)(&value, &record.supported) {
            return Err(C2Error::BadValue);
        }

        let value = match (id, value) {
            (ParamId::IonUsage, ParamValue::IonUsage(mut ion)) => {
                // The hint only carries usage and capacity; everything else
                // is owned by the allocator.
                ion.heap_mask = !0;
                ion.alloc_flags = 0;
                ion.min_alignment = 0;
                ParamValue::IonUsage(ion)
            }
            (ParamId::DmaBufUsage, ParamValue::DmaBufUsage(mut dmabuf)) => {
                dmabuf.heap_name = select_heap_name(dmabuf.usage, self.heaps).to_string();
                dmabuf.alloc_flags = 0;
                ParamValue::DmaBufUsage(dmabuf)
            }
            (ParamId::RequestSyncFrame, ParamValue::Bool(requested)) => {
                if requested {
                    self.sync_frame_requested = true;
                }
                // The trigger is edge-triggered; the stored value stays
                // false so a later query does not re-arm it.
                ParamValue::Bool(false)
            }
            (ParamId::DropFramePts, ParamValue::Pts(pts)) => {
                self.pending_drops.extend_from_slice(&pts);
                ParamValue::Pts(vec![])
            }
            (_, value) => value,
        };
        self.values.insert(id, value);
        Ok(())
    }

    // Typed accessors for the component workers. Config changes must take
    // effect no later than the next work item, so the workers re-read these
    // every tick.

    pub fn picture_size(&self) -> Resolution {
        match self.values.get(&ParamId::PictureSize) {
            Some(ParamValue::Size { width, height }) => Resolution::new(*width, *height),
            _ => Resolution::default(),
        }
    }

    pub fn bitrate(&self) -> u32 {
        match self.values.get(&ParamId::Bitrate) {
            Some(ParamValue::U32(v)) => *v,
            _ => 0,
        }
    }

    pub fn framerate(&self) -> u32 {
        match self.values.get(&ParamId::FrameRate) {
            Some(ParamValue::U32(v)) => *v,
            _ => 30,
        }
    }

    pub fn intra_refresh(&self) -> u32 {
        match self.values.get(&ParamId::IntraRefresh) {
            Some(ParamValue::U32(v)) => *v,
            _ => 0,
        }
    }

    pub fn temporal_layers(&self) -> u32 {
        match self.values.get(&ParamId::TemporalLayerCount) {
            Some(ParamValue::U32(v)) => *v,
            _ => 0,
        }
    }

    pub fn qp_bounds(&self) -> (u32, u32) {
        match self.values.get(&ParamId::QpBounds) {
            Some(ParamValue::QpBounds { min, max }) => (*min, *max),
            _ => (0, 51),
        }
    }

    pub fn prepend_header(&self) -> bool {
        matches!(self.values.get(&ParamId::PrependHeaderMode), Some(ParamValue::Bool(true)))
    }

    pub fn low_memory(&self) -> bool {
        matches!(self.values.get(&ParamId::LowMemoryMode), Some(ParamValue::Bool(true)))
    }

    pub fn fbc_mode(&self) -> u32 {
        match self.values.get(&ParamId::FbcOutputMode) {
            Some(ParamValue::U32(v)) => *v,
            _ => 0,
        }
    }

    pub fn scaling_mode(&self) -> u32 {
        match self.values.get(&ParamId::ScalingOutputMode) {
            Some(ParamValue::U32(v)) => *v,
            _ => 0,
        }
    }

    pub fn output_delay(&self) -> u32 {
        match self.values.get(&ParamId::OutputDelay) {
            Some(ParamValue::U32(v)) => *v,
            _ => 4,
        }
    }

    /// Consumes the accumulated drop-list entries. Worker-thread only.
    pub fn take_pending_drops(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.pending_drops)
    }

    /// Consumes an edge-triggered sync-frame request.
    pub fn take_sync_request(&mut self) -> bool {
        std::mem::take(&mut self.sync_frame_requested)
    }

    /// Called by the decoder on info-change to publish the new host-visible
    /// output format.
    pub fn update_stream(&mut self, size: Resolution, aspects: ColorAspects) {
        self.values
            .insert(ParamId::PictureSize, ParamValue::Size { width: size.width, height: size.height });
        self.values.insert(ParamId::VuiColorAspects, ParamValue::ColorAspects(aspects));
    }
}
