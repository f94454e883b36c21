//! GOF muxer: assembles a GOF's VPS, atlas sub-bitstream and three encoded
//! video sub-bitstreams into a V3C chunk, in classical or low-delay mode.

use crate::annexb::find_nals;
use crate::bitstream::{ceil_log2, BitWriter};
use crate::error::{EncoderError, Result};
use crate::model::{Gof, V3cChunk};

/// Video sub-bitstreams are exchanged between the 2D encoders and the muxer
/// already converted to the 4-byte length-prefixed sample stream form.
pub const VIDEO_NAL_PRECISION: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum V3cUnitType {
    Vps = 0,
    Ad = 1,
    Ovd = 2,
    Gvd = 3,
    Avd = 4,
}

#[derive(Debug, Default, Clone, Copy)]
struct V3cHeaderFields {
    map_index: u8,
    aux_video_flag: bool,
    attribute_index: u8,
    attribute_partition_index: u8,
}

fn write_v3c_header(bw: &mut BitWriter, unit_type: V3cUnitType, vps_id: u8, fields: V3cHeaderFields) {
    const ATLAS_ID: u8 = 0; // single atlas
    match unit_type {
        V3cUnitType::Vps => bw.put(0, 32),
        V3cUnitType::Ad | V3cUnitType::Ovd => {
            bw.put(unit_type as u64, 5);
            bw.put(vps_id as u64, 4);
            bw.put(ATLAS_ID as u64, 6);
            bw.put(0, 17);
        }
        V3cUnitType::Gvd => {
            bw.put(unit_type as u64, 5);
            bw.put(vps_id as u64, 4);
            bw.put(ATLAS_ID as u64, 6);
            bw.put(fields.map_index as u64, 4);
            bw.put(fields.aux_video_flag as u64, 1);
            bw.put(0, 12);
        }
        V3cUnitType::Avd => {
            bw.put(unit_type as u64, 5);
            bw.put(vps_id as u64, 4);
            bw.put(ATLAS_ID as u64, 6);
            bw.put(fields.attribute_index as u64, 7);
            bw.put(fields.attribute_partition_index as u64, 5);
            bw.put(fields.map_index as u64, 4);
            bw.put(fields.aux_video_flag as u64, 1);
        }
    }
}

/// Precision, in bytes, of the V3C unit length prefixes for one GOF's chunk.
fn v3c_precision(max_size: u64) -> u8 {
    std::cmp::max(1, ceil_log2(max_size + 1).div_ceil(8)) as u8
}

/// A muxed GOF: its chunk plus the V3C-unit length precision it requires.
/// The overall output stream's precision is the max observed across GOFs
/// (it never decreases).
#[derive(Debug, Clone)]
pub struct MuxedGof {
    pub chunk: V3cChunk,
    pub precision: u8,
}

fn append_unit(out: &mut Vec<u8>, unit_sizes: &mut Vec<usize>, header: [u8; 4], payload: &[u8]) {
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    unit_sizes.push(4 + payload.len());
}

fn write_header_bytes(unit_type: V3cUnitType, vps_id: u8, fields: V3cHeaderFields) -> [u8; 4] {
    let mut bw = BitWriter::new();
    write_v3c_header(&mut bw, unit_type, vps_id, fields);
    let bytes = bw.take_chunks().expect("header write is always byte-aligned");
    bytes.try_into().expect("V3C unit header is always 4 bytes")
}

/// Mux one GOF in classical mode: a single chunk containing VPS, AD, OVD,
/// GVD, AVD, in that order.
pub fn mux_classical(gof: &Gof) -> Result<MuxedGof> {
    let vps = gof
        .vps
        .as_ref()
        .ok_or_else(|| EncoderError::Internal("mux_classical: GOF has no VPS".to_string()))?;
    let atlas = gof.atlas_context.as_ref().ok_or_else(|| {
        EncoderError::Internal("mux_classical: GOF has no atlas context".to_string())
    })?;
    let ovd = gof
        .ovd
        .as_ref()
        .ok_or_else(|| EncoderError::Internal("mux_classical: GOF has no OVD".to_string()))?;
    let gvd = gof
        .gvd
        .as_ref()
        .ok_or_else(|| EncoderError::Internal("mux_classical: GOF has no GVD".to_string()))?;
    let avd = gof
        .avd
        .as_ref()
        .ok_or_else(|| EncoderError::Internal("mux_classical: GOF has no AVD".to_string()))?;

    let vps_id = gof.vps_parameter_set_id();
    let mut vps_bw = BitWriter::new();
    vps.write(&mut vps_bw)?;
    let vps_payload = vps_bw.take_chunks()?;
    let atlas_payload = atlas.write_classical()?;

    let max_unit_len = [vps_payload.len(), atlas_payload.len(), ovd.len(), gvd.len(), avd.len()]
        .into_iter()
        .map(|len| len + 4)
        .max()
        .unwrap_or(4);
    let precision = v3c_precision(max_unit_len as u64);

    let mut data = Vec::new();
    let mut unit_sizes = Vec::new();
    append_unit(
        &mut data,
        &mut unit_sizes,
        write_header_bytes(V3cUnitType::Vps, vps_id, V3cHeaderFields::default()),
        &vps_payload,
    );
    append_unit(
        &mut data,
        &mut unit_sizes,
        write_header_bytes(V3cUnitType::Ad, vps_id, V3cHeaderFields::default()),
        &atlas_payload,
    );
    append_unit(
        &mut data,
        &mut unit_sizes,
        write_header_bytes(V3cUnitType::Ovd, vps_id, V3cHeaderFields::default()),
        ovd,
    );
    append_unit(
        &mut data,
        &mut unit_sizes,
        write_header_bytes(V3cUnitType::Gvd, vps_id, V3cHeaderFields::default()),
        gvd,
    );
    append_unit(
        &mut data,
        &mut unit_sizes,
        write_header_bytes(V3cUnitType::Avd, vps_id, V3cHeaderFields::default()),
        avd,
    );

    Ok(MuxedGof {
        chunk: V3cChunk { data, unit_sizes },
        precision,
    })
}

/// A frame's prolog NALs (parameter sets + SEI, k==0 only, one slice per NAL
/// payload) and picture NALs.
type FrameVideoNals<'a> = (Vec<&'a [u8]>, Vec<&'a [u8]>);

/// Extract the NALs of interest from a 2D encoder's 4-byte length-prefixed
/// sample stream: the first four (3 parameter sets + 1 SEI prefix) as the
/// k==0 prolog, one picture NAL for frame `k` (or two if `double_layer`).
fn video_nals_for_frame(
    sample_stream: &[u8],
    frame_index: usize,
    double_layer: bool,
) -> Result<FrameVideoNals<'_>> {
    let nals = find_nals(sample_stream, VIDEO_NAL_PRECISION);
    let prolog_count = 4;
    let picture_count_per_frame = if double_layer { 2 } else { 1 };
    let prolog = if frame_index == 0 && nals.len() >= prolog_count {
        nals[..prolog_count]
            .iter()
            .map(|n| &sample_stream[n.location..n.location + n.size])
            .collect()
    } else {
        Vec::new()
    };
    let picture_start = prolog_count + frame_index * picture_count_per_frame;
    let mut pictures = Vec::with_capacity(picture_count_per_frame);
    for i in 0..picture_count_per_frame {
        let nal = nals.get(picture_start + i).ok_or_else(|| {
            EncoderError::Internal(format!(
                "video sample stream is missing picture NAL for frame {frame_index}"
            ))
        })?;
        pictures.push(&sample_stream[nal.location..nal.location + nal.size]);
    }
    Ok((prolog, pictures))
}

fn append_length_prefixed(out: &mut Vec<u8>, precision: usize, payload: &[u8]) {
    let len = payload.len() as u64;
    for shift in (0..precision).rev() {
        out.push(((len >> (shift * 8)) & 0xff) as u8);
    }
    out.extend_from_slice(payload);
}

/// Mux one GOF in low-delay mode: one chunk containing, per frame, one AD,
/// OVD, GVD and AVD unit.
pub fn mux_low_delay(gof: &Gof, double_layer: bool) -> Result<MuxedGof> {
    let vps = gof
        .vps
        .as_ref()
        .ok_or_else(|| EncoderError::Internal("mux_low_delay: GOF has no VPS".to_string()))?;
    let atlas = gof.atlas_context.as_ref().ok_or_else(|| {
        EncoderError::Internal("mux_low_delay: GOF has no atlas context".to_string())
    })?;
    let ovd = gof
        .ovd
        .as_ref()
        .ok_or_else(|| EncoderError::Internal("mux_low_delay: GOF has no OVD".to_string()))?;
    let gvd = gof
        .gvd
        .as_ref()
        .ok_or_else(|| EncoderError::Internal("mux_low_delay: GOF has no GVD".to_string()))?;
    let avd = gof
        .avd
        .as_ref()
        .ok_or_else(|| EncoderError::Internal("mux_low_delay: GOF has no AVD".to_string()))?;

    let vps_id = gof.vps_parameter_set_id();
    let mut vps_bw = BitWriter::new();
    vps.write(&mut vps_bw)?;
    let vps_payload = vps_bw.take_chunks()?;

    let mut data = Vec::new();
    let mut unit_sizes = Vec::new();
    let mut max_unit_len = vps_payload.len() + 4;

    append_unit(
        &mut data,
        &mut unit_sizes,
        write_header_bytes(V3cUnitType::Vps, vps_id, V3cHeaderFields::default()),
        &vps_payload,
    );

    for frame_index in 0..atlas.frame_count() {
        // AD unit.
        let mut ad_bw = BitWriter::new();
        ad_bw.put(((atlas.nal_precision - 1) as u64) << 5, 8);
        if frame_index == 0 {
            ad_bw.put(atlas.asps_nal().len() as u64, atlas.nal_precision * 8);
            ad_bw.copy_bytes(atlas.asps_nal())?;
            ad_bw.put(atlas.afps_nal().len() as u64, atlas.nal_precision * 8);
            ad_bw.copy_bytes(atlas.afps_nal())?;
        }
        let atl_nal = atlas.atl_nal(frame_index);
        ad_bw.put(atl_nal.len() as u64, atlas.nal_precision * 8);
        ad_bw.copy_bytes(atl_nal)?;
        ad_bw.put(atlas.eob_nal().len() as u64, atlas.nal_precision * 8);
        ad_bw.copy_bytes(atlas.eob_nal())?;
        let ad_payload = ad_bw.take_chunks()?;
        max_unit_len = max_unit_len.max(ad_payload.len() + 4);
        append_unit(
            &mut data,
            &mut unit_sizes,
            write_header_bytes(V3cUnitType::Ad, vps_id, V3cHeaderFields::default()),
            &ad_payload,
        );

        // OVD unit: never double-layer.
        let (ovd_prolog, ovd_pictures) = video_nals_for_frame(ovd, frame_index, false)?;
        let ovd_payload = build_ld_video_unit(&ovd_prolog, &ovd_pictures);
        max_unit_len = max_unit_len.max(ovd_payload.len() + 4);
        append_unit(
            &mut data,
            &mut unit_sizes,
            write_header_bytes(V3cUnitType::Ovd, vps_id, V3cHeaderFields::default()),
            &ovd_payload,
        );

        // GVD unit.
        let (gvd_prolog, gvd_pictures) = video_nals_for_frame(gvd, frame_index, double_layer)?;
        let gvd_payload = build_ld_video_unit(&gvd_prolog, &gvd_pictures);
        max_unit_len = max_unit_len.max(gvd_payload.len() + 4);
        append_unit(
            &mut data,
            &mut unit_sizes,
            write_header_bytes(V3cUnitType::Gvd, vps_id, V3cHeaderFields::default()),
            &gvd_payload,
        );

        // AVD unit.
        let (avd_prolog, avd_pictures) = video_nals_for_frame(avd, frame_index, double_layer)?;
        let avd_payload = build_ld_video_unit(&avd_prolog, &avd_pictures);
        max_unit_len = max_unit_len.max(avd_payload.len() + 4);
        append_unit(
            &mut data,
            &mut unit_sizes,
            write_header_bytes(V3cUnitType::Avd, vps_id, V3cHeaderFields::default()),
            &avd_payload,
        );
    }

    Ok(MuxedGof {
        chunk: V3cChunk { data, unit_sizes },
        precision: v3c_precision(max_unit_len as u64),
    })
}

fn build_ld_video_unit(prolog: &[&[u8]], pictures: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in prolog {
        append_length_prefixed(&mut out, VIDEO_NAL_PRECISION, nal);
    }
    for picture in pictures {
        append_length_prefixed(&mut out, VIDEO_NAL_PRECISION, picture);
    }
    out
}

/// Serialize a full run's muxed GOFs into the wire-format V3C sample
/// stream: one header byte carrying the overall precision, then each
/// chunk's units individually length-prefixed.
pub fn serialize_v3c_sample_stream(muxed: &[MuxedGof]) -> Vec<u8> {
    let precision = muxed.iter().map(|m| m.precision).max().unwrap_or(1) as usize;
    let mut out = vec![(((precision - 1) as u8) << 5)];
    for m in muxed {
        let mut offset = 0;
        for &size in &m.chunk.unit_sizes {
            append_length_prefixed(&mut out, precision, &m.chunk.data[offset..offset + size]);
            offset += size;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::AtlasContext;
    use crate::model::Frame;
    use crate::parameters::Parameters;
    use crate::vps::Vps;

    fn params() -> Parameters {
        let mut p = Parameters::new();
        p.set_parameter("geoBitDepthInput", "10").unwrap();
        p.freeze().unwrap();
        p
    }

    fn built_gof(gof_id: u32) -> Gof {
        let mut gof = Gof::new(gof_id);
        gof.map_height = 256;
        gof.frames.push(Frame::new(0, 10));
        let params = params();
        gof.vps = Some(Vps::build(&gof, &params).unwrap());
        gof.atlas_context = Some(AtlasContext::build(&gof, &params).unwrap());
        gof.ovd = Some(vec![0u8; 8]);
        gof.gvd = Some(vec![0u8; 8]);
        gof.avd = Some(vec![0u8; 8]);
        gof
    }

    #[test]
    fn classical_chunk_unit_sizes_sum_to_payload_length() {
        let gof = built_gof(0);
        let muxed = mux_classical(&gof).unwrap();
        assert!(muxed.chunk.payload_len_matches_unit_sizes());
        assert_eq!(muxed.chunk.unit_sizes.len(), 5);
    }

    #[test]
    fn classical_first_unit_header_is_vps_type_zero() {
        let gof = built_gof(3);
        let muxed = mux_classical(&gof).unwrap();
        assert_eq!(&muxed.chunk.data[0..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn serialize_embeds_correct_number_of_chunks() {
        let g0 = built_gof(0);
        let g1 = built_gof(1);
        let m0 = mux_classical(&g0).unwrap();
        let m1 = mux_classical(&g1).unwrap();
        let out = serialize_v3c_sample_stream(&[m0, m1]);
        assert!(!out.is_empty());
        assert_eq!(out[0] >> 5, 0); // precision 1 -> (precision-1)=0
    }

    fn sample_stream_of(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            append_length_prefixed(&mut out, VIDEO_NAL_PRECISION, nal);
        }
        out
    }

    #[test]
    fn video_nals_for_frame_k0_prolog_has_four_nals() {
        let stream = sample_stream_of(&[&[1], &[2, 2], &[3, 3, 3], &[4, 4, 4, 4], &[9, 9]]);
        let (prolog, pictures) = video_nals_for_frame(&stream, 0, false).unwrap();
        assert_eq!(prolog, vec![&[1u8][..], &[2, 2][..], &[3, 3, 3][..], &[4, 4, 4, 4][..]]);
        assert_eq!(pictures, vec![&[9u8, 9][..]]);
    }

    #[test]
    fn build_ld_video_unit_length_prefixes_every_prolog_nal() {
        let stream = sample_stream_of(&[&[1], &[2, 2], &[3, 3, 3], &[4, 4, 4, 4], &[9, 9]]);
        let (prolog, pictures) = video_nals_for_frame(&stream, 0, false).unwrap();
        let unit = build_ld_video_unit(&prolog, &pictures);

        // Re-parsing the emitted unit as a length-prefixed sample stream must
        // recover exactly the 4 prolog NALs plus the picture NAL: every NAL,
        // including the first prolog NAL, carries its own length prefix.
        let reparsed = find_nals(&unit, VIDEO_NAL_PRECISION);
        assert_eq!(reparsed.len(), 5);
        let payloads: Vec<&[u8]> =
            reparsed.iter().map(|n| &unit[n.location..n.location + n.size]).collect();
        assert_eq!(
            payloads,
            vec![&[1u8][..], &[2, 2][..], &[3, 3, 3][..], &[4, 4, 4, 4][..], &[9, 9][..]]
        );
    }

    #[test]
    fn video_nals_for_frame_k_gt_0_has_no_prolog() {
        let stream = sample_stream_of(&[&[1], &[2, 2], &[3, 3, 3], &[4, 4, 4, 4], &[9, 9], &[8, 8]]);
        let (prolog, pictures) = video_nals_for_frame(&stream, 1, false).unwrap();
        assert!(prolog.is_empty());
        assert_eq!(pictures, vec![&[8u8, 8][..]]);
    }
}
