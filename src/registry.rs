// Copyright 2025 Rockchip Electronics Co., Ltd.
// SPDX-License-Identifier: Apache-2.0

//! Static component registry and SoC capability filter.
//!
//! The table below is the population-time list of every component this
//! vendor store can ever expose. Whether a given entry actually shows up in
//! `list_components()` depends on the [`ChipCapability`] oracle for the
//! running SoC.

use crate::CodingType;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Decoder,
    Encoder,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Domain {
    Audio,
    Video,
    Image,
    Other,
}

pub const MIME_VIDEO_AVC: &str = "video/avc";
pub const MIME_VIDEO_HEVC: &str = "video/hevc";
pub const MIME_VIDEO_VP9: &str = "video/x-vnd.on2.vp9";
pub const MIME_VIDEO_VP8: &str = "video/x-vnd.on2.vp8";
pub const MIME_VIDEO_MPEG2: &str = "video/mpeg2";
pub const MIME_VIDEO_MPEG4: &str = "video/mp4v-es";
pub const MIME_VIDEO_H263: &str = "video/3gpp";
pub const MIME_VIDEO_AV1: &str = "video/av01";
pub const MIME_VIDEO_AVS2: &str = "video/avs2";

/// Immutable registry record. The name encodes the kind (`".decoder"` /
/// `".encoder"`) and carries a `.secure` suffix for the protected-memory
/// variants. `aliases` lists the legacy names the host may still use,
/// comma-separated, empty when none survive.
#[derive(Debug, PartialEq, Eq)]
pub struct ComponentEntry {
    pub name: &'static str,
    pub mime: &'static str,
    pub kind: Kind,
    pub aliases: &'static str,
}

const fn entry(
    name: &'static str,
    mime: &'static str,
    kind: Kind,
    aliases: &'static str,
) -> ComponentEntry {
    ComponentEntry { name, mime, kind, aliases }
}

pub static COMPONENT_TABLE: &[ComponentEntry] = &[
    entry("c2.rk.avc.decoder", MIME_VIDEO_AVC, Kind::Decoder, "OMX.rk.video_decoder.avc"),
    entry("c2.rk.vp9.decoder", MIME_VIDEO_VP9, Kind::Decoder, "OMX.rk.video_decoder.vp9"),
    entry("c2.rk.hevc.decoder", MIME_VIDEO_HEVC, Kind::Decoder, "OMX.rk.video_decoder.hevc"),
    entry("c2.rk.vp8.decoder", MIME_VIDEO_VP8, Kind::Decoder, "OMX.rk.video_decoder.vp8"),
    entry("c2.rk.mpeg2.decoder", MIME_VIDEO_MPEG2, Kind::Decoder, "OMX.rk.video_decoder.m2v"),
    entry("c2.rk.m4v.decoder", MIME_VIDEO_MPEG4, Kind::Decoder, "OMX.rk.video_decoder.m4v"),
    entry("c2.rk.h263.decoder", MIME_VIDEO_H263, Kind::Decoder, "OMX.rk.video_decoder.h263"),
    entry("c2.rk.av1.decoder", MIME_VIDEO_AV1, Kind::Decoder, ""),
    entry("c2.rk.avs2.decoder", MIME_VIDEO_AVS2, Kind::Decoder, ""),
    entry(
        "c2.rk.avc.decoder.secure",
        MIME_VIDEO_AVC,
        Kind::Decoder,
        "OMX.rk.video_decoder.avc.secure",
    ),
    entry(
        "c2.rk.vp9.decoder.secure",
        MIME_VIDEO_VP9,
        Kind::Decoder,
        "OMX.rk.video_decoder.vp9.secure",
    ),
    entry(
        "c2.rk.hevc.decoder.secure",
        MIME_VIDEO_HEVC,
        Kind::Decoder,
        "OMX.rk.video_decoder.hevc.secure",
    ),
    entry(
        "c2.rk.vp8.decoder.secure",
        MIME_VIDEO_VP8,
        Kind::Decoder,
        "OMX.rk.video_decoder.vp8.secure",
    ),
    entry(
        "c2.rk.mpeg2.decoder.secure",
        MIME_VIDEO_MPEG2,
        Kind::Decoder,
        "OMX.rk.video_decoder.m2v.secure",
    ),
    entry(
        "c2.rk.m4v.decoder.secure",
        MIME_VIDEO_MPEG4,
        Kind::Decoder,
        "OMX.rk.video_decoder.m4v.secure",
    ),
    entry("c2.rk.av1.decoder.secure", MIME_VIDEO_AV1, Kind::Decoder, ""),
    entry("c2.rk.avs2.decoder.secure", MIME_VIDEO_AVS2, Kind::Decoder, ""),
    entry("c2.rk.avc.encoder", MIME_VIDEO_AVC, Kind::Encoder, "OMX.rk.video_encoder.avc"),
    entry("c2.rk.hevc.encoder", MIME_VIDEO_HEVC, Kind::Encoder, "OMX.rk.video_encoder.hevc"),
];

/// Case-insensitive registry lookup.
pub fn component_entry(name: &str) -> Option<&'static ComponentEntry> {
    COMPONENT_TABLE.iter().find(|e| e.name.eq_ignore_ascii_case(name))
}

pub fn coding_from_mime(mime: &str) -> Option<CodingType> {
    match mime {
        MIME_VIDEO_AVC => Some(CodingType::Avc),
        MIME_VIDEO_HEVC => Some(CodingType::Hevc),
        MIME_VIDEO_VP9 => Some(CodingType::Vp9),
        MIME_VIDEO_VP8 => Some(CodingType::Vp8),
        MIME_VIDEO_MPEG2 => Some(CodingType::Mpeg2),
        MIME_VIDEO_MPEG4 => Some(CodingType::Mpeg4),
        MIME_VIDEO_H263 => Some(CodingType::H263),
        MIME_VIDEO_AV1 => Some(CodingType::Av1),
        MIME_VIDEO_AVS2 => Some(CodingType::Avs2),
        _ => None,
    }
}

pub fn mime_from_coding(coding: CodingType) -> &'static str {
    match coding {
        CodingType::Avc => MIME_VIDEO_AVC,
        CodingType::Hevc => MIME_VIDEO_HEVC,
        CodingType::Vp9 => MIME_VIDEO_VP9,
        CodingType::Vp8 => MIME_VIDEO_VP8,
        CodingType::Mpeg2 => MIME_VIDEO_MPEG2,
        CodingType::Mpeg4 => MIME_VIDEO_MPEG4,
        CodingType::H263 => MIME_VIDEO_H263,
        CodingType::Av1 => MIME_VIDEO_AV1,
        CodingType::Avs2 => MIME_VIDEO_AVS2,
    }
}

pub fn coding_from_name(name: &str) -> Option<CodingType> {
    component_entry(name).and_then(|e| coding_from_mime(e.mime))
}

pub fn is_secure(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".secure")
}

pub fn kind_from_name(name: &str) -> Option<Kind> {
    let lower = name.to_ascii_lowercase();
    if lower.contains(".decoder") {
        Some(Kind::Decoder)
    } else if lower.contains(".encoder") {
        Some(Kind::Encoder)
    } else {
        None
    }
}

/// SoC capability oracle. The store asks this before exposing a registry
/// entry, so a chip without e.g. an HEVC encoder never lists one.
pub trait ChipCapability: Send + Sync {
    fn supported(&self, kind: Kind, coding: CodingType) -> bool;
}

/// Oracle claiming support for every registered coding.
pub struct FullSupport;

impl ChipCapability for FullSupport {
    fn supported(&self, _kind: Kind, _coding: CodingType) -> bool {
        true
    }
}
