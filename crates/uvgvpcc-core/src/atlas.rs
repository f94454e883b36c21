//! Atlas context: ASPS/AFPS/atlas-tile-layer construction, the size
//! pre-pass, and classical-mode NAL sample-stream emission.

use crate::bitstream::{ceil_log2, BitWriter};
use crate::error::{EncoderError, Result};
use crate::model::{Gof, Patch};
use crate::parameters::Parameters;

const PATCH_MODE_I_INTRA: u64 = 0;
const PATCH_MODE_I_END: u64 = 14;
const ATH_TYPE_I_TILE: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NalUnitType {
    AtlTileLayerIdrNLp,
    Asps,
    Afps,
    Eob,
}

impl NalUnitType {
    fn code(self) -> u64 {
        match self {
            NalUnitType::AtlTileLayerIdrNLp => 0,
            NalUnitType::Asps => 13,
            NalUnitType::Afps => 14,
            NalUnitType::Eob => 15,
        }
    }
}

fn write_nal_header(bw: &mut BitWriter, nal_type: NalUnitType) {
    bw.put(0, 1); // forbidden_zero_bit
    bw.put(nal_type.code(), 6);
    bw.put(0, 1); // reserved
}

/// Atlas Sequence Parameter Set.
#[derive(Debug, Clone)]
pub struct Asps {
    pub frame_width: u32,
    pub frame_height: u32,
    pub geometry_3d_bit_depth_minus1: u32,
    pub geometry_2d_bit_depth_minus1: u32,
    pub log2_max_atlas_frame_order_cnt_lsb_minus4: u32,
    pub log2_patch_packing_block_size: u32,
    pub map_count_minus1: u8,
    pub normal_axis_limits_quantization_enabled_flag: bool,
    pub normal_axis_max_delta_value_enabled_flag: bool,
    pub vpcc_remove_duplicate_point_enabled_flag: bool,
}

impl Asps {
    fn build(gof: &Gof, params: &Parameters) -> Result<Self> {
        let geo_bit_depth_input = params.geo_bit_depth_input.ok_or_else(|| {
            EncoderError::Configuration("geoBitDepthInput is required".to_string())
        })?;
        Ok(Self {
            frame_width: params.map_width,
            frame_height: gof.map_height,
            geometry_3d_bit_depth_minus1: geo_bit_depth_input,
            geometry_2d_bit_depth_minus1: 7,
            log2_max_atlas_frame_order_cnt_lsb_minus4: 6,
            log2_patch_packing_block_size: ceil_log2(params.occupancy_map_ds_resolution as u64),
            map_count_minus1: params.double_layer as u8,
            normal_axis_limits_quantization_enabled_flag: true,
            normal_axis_max_delta_value_enabled_flag: true,
            vpcc_remove_duplicate_point_enabled_flag: true,
        })
    }

    pub fn log2_max_atlas_frame_order_cnt_lsb(&self) -> u32 {
        self.log2_max_atlas_frame_order_cnt_lsb_minus4 + 4
    }

    fn write(&self, bw: &mut BitWriter) {
        bw.put_ue(self.frame_width as u64);
        bw.put_ue(self.frame_height as u64);
        bw.put_ue(self.log2_patch_packing_block_size as u64);
        bw.put_ue(self.log2_max_atlas_frame_order_cnt_lsb_minus4 as u64);
        bw.put_ue(1); // asps_num_ref_atlas_frame_lists_in_asps: a single list
        bw.put_ue(1); // num_ref_entries in that list
        bw.put_ue(1); // abs_delta_afoc_st
        bw.put(self.map_count_minus1 as u64, 4);
        bw.put_ue(self.geometry_3d_bit_depth_minus1 as u64);
        bw.put(self.geometry_2d_bit_depth_minus1 as u64, 5);
        bw.put(1, 1); // asps_vpcc_extension_present_flag
        bw.put(self.normal_axis_limits_quantization_enabled_flag as u64, 1);
        bw.put(self.normal_axis_max_delta_value_enabled_flag as u64, 1);
        bw.put(self.vpcc_remove_duplicate_point_enabled_flag as u64, 1);
        bw.rbsp_trailing_bits();
    }
}

/// Atlas Frame Parameter Set.
#[derive(Debug, Clone)]
pub struct Afps {
    pub afps_atlas_sequence_parameter_set_id: u32,
    pub single_tile_in_atlas_frame_flag: bool,
    pub lod_mode_enabled_flag: bool,
    pub raw_3d_offset_bit_count_explicit_mode_flag: bool,
}

impl Default for Afps {
    fn default() -> Self {
        Self {
            afps_atlas_sequence_parameter_set_id: 0,
            single_tile_in_atlas_frame_flag: true,
            lod_mode_enabled_flag: false,
            raw_3d_offset_bit_count_explicit_mode_flag: false,
        }
    }
}

impl Afps {
    fn write(&self, bw: &mut BitWriter) {
        bw.put_ue(self.afps_atlas_sequence_parameter_set_id as u64);
        bw.put(self.single_tile_in_atlas_frame_flag as u64, 1);
        bw.put(self.lod_mode_enabled_flag as u64, 1);
        bw.put(self.raw_3d_offset_bit_count_explicit_mode_flag as u64, 1);
        bw.put(1, 1); // afps_extension_present_flag
        bw.put(0, 1); // afps_vpcc_extension_flag
        bw.put(0, 1); // afps_miv_extension_flag
        bw.rbsp_trailing_bits();
    }
}

fn write_patch_data_unit(bw: &mut BitWriter, asps: &Asps, pos_min_d_quantizer: u32, pos_delta_max_d_quantizer: u32, patch: &Patch) {
    bw.put_ue(PATCH_MODE_I_INTRA);
    bw.put_ue(patch.om_ds_pos_x as u64);
    bw.put_ue(patch.om_ds_pos_y as u64);
    bw.put_ue(patch.width_in_occ_blk.saturating_sub(1) as u64);
    bw.put_ue(patch.height_in_occ_blk.saturating_sub(1) as u64);

    let uv_bits = asps.geometry_3d_bit_depth_minus1 + 1;
    bw.put(patch.pos_u as u64, uv_bits as u8);
    bw.put(patch.pos_v as u64, uv_bits as u8);

    let d_bits = uv_bits - pos_min_d_quantizer + 1;
    bw.put(patch.pos_d as u64, d_bits as u8);

    let range_bits = std::cmp::min(asps.geometry_2d_bit_depth_minus1 + 1, uv_bits) + 1
        - pos_delta_max_d_quantizer;
    bw.put(patch.range_d as u64, range_bits as u8);

    bw.put(patch.patch_ppi as u64, 3);
    bw.put(patch.axis_swap as u64, 1);
}

/// Writes one frame's atlas tile layer RBSP (header + data unit + terminator).
fn write_atlas_tile_layer(
    bw: &mut BitWriter,
    asps: &Asps,
    afps: &Afps,
    frame_index: usize,
    patches: &[Patch],
    min_level: u32,
) -> Result<()> {
    let ath_ref_atlas_frame_list_asps_flag = true; // one ASPS-level ref list is always constructed
    if !ath_ref_atlas_frame_list_asps_flag {
        return Err(EncoderError::Internal(
            "ath_ref_atlas_frame_list_asps_flag=false is not implemented".to_string(),
        ));
    }

    let lsb_bits = asps.log2_max_atlas_frame_order_cnt_lsb();
    let pos_min_d_quantizer = ceil_log2(min_level.max(1) as u64);
    let pos_delta_max_d_quantizer = pos_min_d_quantizer;

    bw.put_ue(afps.afps_atlas_sequence_parameter_set_id as u64);
    bw.put((frame_index as u64) % (1u64 << lsb_bits), lsb_bits as u8);
    bw.put(1, 1); // ath_ref_atlas_frame_list_asps_flag
    bw.put(ATH_TYPE_I_TILE, 3);
    bw.put(pos_min_d_quantizer as u64, 5);
    bw.put(pos_delta_max_d_quantizer as u64, 5);

    for patch in patches {
        write_patch_data_unit(bw, asps, pos_min_d_quantizer, pos_delta_max_d_quantizer, patch);
    }
    bw.put_ue(PATCH_MODE_I_END);
    bw.rbsp_trailing_bits();
    Ok(())
}

fn write_nal(nal_type: NalUnitType, body: impl FnOnce(&mut BitWriter)) -> Result<Vec<u8>> {
    let mut bw = BitWriter::new();
    write_nal_header(&mut bw, nal_type);
    body(&mut bw);
    bw.take_chunks()
}

/// Per-GOF aggregate of ASPS, AFPS, one atlas tile layer NAL per frame, and
/// the end-of-bitstream NAL, with the size pre-pass already run.
#[derive(Debug, Clone)]
pub struct AtlasContext {
    pub asps: Asps,
    pub afps: Afps,
    asps_nal: Vec<u8>,
    afps_nal: Vec<u8>,
    atl_nals: Vec<Vec<u8>>,
    eob_nal: Vec<u8>,
    pub nal_precision: u8,
}

impl AtlasContext {
    /// Build the atlas context for `gof` and run the size pre-pass.
    pub fn build(gof: &Gof, params: &Parameters) -> Result<Self> {
        let asps = Asps::build(gof, params)?;
        let afps = Afps::default();

        let asps_nal = write_nal(NalUnitType::Asps, |bw| asps.write(bw))?;
        let afps_nal = write_nal(NalUnitType::Afps, |bw| afps.write(bw))?;

        let mut atl_nals = Vec::with_capacity(gof.frames.len());
        for (idx, frame) in gof.frames.iter().enumerate() {
            let nal = write_nal(NalUnitType::AtlTileLayerIdrNLp, |bw| {
                write_atlas_tile_layer(bw, &asps, &afps, idx, &frame.patches, params.min_level)
                    .expect("ref-list flag is always true by construction")
            })?;
            atl_nals.push(nal);
        }

        let eob_nal = write_nal(NalUnitType::Eob, |bw| bw.put(0, 8))?;

        let max_nal_size = [asps_nal.len(), afps_nal.len(), eob_nal.len()]
            .into_iter()
            .chain(atl_nals.iter().map(Vec::len))
            .max()
            .unwrap_or(1) as u64;
        let nal_precision = std::cmp::max(1, ceil_log2(max_nal_size + 1).div_ceil(8)) as u8;

        Ok(Self {
            asps,
            afps,
            asps_nal,
            afps_nal,
            atl_nals,
            eob_nal,
            nal_precision,
        })
    }

    /// Total atlas sub-bitstream length in bytes, as described in the size
    /// pre-pass: 1 (sample-stream header) + Σ(precision + size_i) + the
    /// end-of-bitstream NAL's own (precision + 2).
    pub fn sub_bitstream_len(&self) -> usize {
        let p = self.nal_precision as usize;
        let body: usize = [&self.asps_nal, &self.afps_nal]
            .into_iter()
            .chain(self.atl_nals.iter())
            .map(|nal| p + nal.len())
            .sum();
        1 + body + (p + self.eob_nal.len())
    }

    pub fn asps_nal(&self) -> &[u8] {
        &self.asps_nal
    }
    pub fn afps_nal(&self) -> &[u8] {
        &self.afps_nal
    }
    pub fn atl_nal(&self, frame_index: usize) -> &[u8] {
        &self.atl_nals[frame_index]
    }
    pub fn eob_nal(&self) -> &[u8] {
        &self.eob_nal
    }
    pub fn frame_count(&self) -> usize {
        self.atl_nals.len()
    }

    fn write_length_prefixed(&self, bw: &mut BitWriter, nal: &[u8]) -> Result<()> {
        bw.put(nal.len() as u64, self.nal_precision * 8);
        bw.copy_bytes(nal)
    }

    /// Classical-mode emission: one sample-stream header byte, then each NAL
    /// length-prefixed, ASPS/AFPS first, then one per frame, then EOB.
    pub fn write_classical(&self) -> Result<Vec<u8>> {
        let mut bw = BitWriter::new();
        bw.put(((self.nal_precision - 1) as u64) << 5, 8);
        self.write_length_prefixed(&mut bw, &self.asps_nal)?;
        self.write_length_prefixed(&mut bw, &self.afps_nal)?;
        for nal in &self.atl_nals {
            self.write_length_prefixed(&mut bw, nal)?;
        }
        self.write_length_prefixed(&mut bw, &self.eob_nal)?;
        bw.take_chunks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::calculate_ue_len;
    use crate::model::Frame;

    fn params(geo_bits: u32) -> Parameters {
        let mut p = Parameters::new();
        p.set_parameter("geoBitDepthInput", &geo_bits.to_string()).unwrap();
        p.freeze().unwrap();
        p
    }

    fn one_frame_gof(patches: Vec<Patch>) -> Gof {
        let mut gof = Gof::new(0);
        gof.map_height = 256;
        let mut frame = Frame::new(0, 10);
        frame.patches = patches;
        gof.frames.push(frame);
        gof
    }

    #[test]
    fn size_prepass_precision_is_at_least_one() {
        let gof = one_frame_gof(vec![]);
        let ctx = AtlasContext::build(&gof, &params(10)).unwrap();
        assert!(ctx.nal_precision >= 1);
    }

    #[test]
    fn classical_output_length_matches_sub_bitstream_len() {
        let patch = Patch {
            width_in_occ_blk: 2,
            height_in_occ_blk: 2,
            width_in_pixel: 8,
            height_in_pixel: 8,
            ..Default::default()
        };
        let gof = one_frame_gof(vec![patch]);
        let ctx = AtlasContext::build(&gof, &params(10)).unwrap();
        let out = ctx.write_classical().unwrap();
        assert_eq!(out.len(), ctx.sub_bitstream_len());
    }

    #[test]
    fn nal_lengths_round_trip_through_find_nals_style_prefixes() {
        let gof = one_frame_gof(vec![]);
        let ctx = AtlasContext::build(&gof, &params(10)).unwrap();
        let out = ctx.write_classical().unwrap();
        // header byte, then [precision-byte length][asps], [precision][afps], [precision][eob]
        let p = ctx.nal_precision as usize;
        let pos = 1usize;
        let read_len = |buf: &[u8], at: usize| -> usize {
            let mut v = 0usize;
            for b in &buf[at..at + p] {
                v = (v << 8) | *b as usize;
            }
            v
        };
        let asps_len = read_len(&out, pos);
        assert_eq!(asps_len, ctx.asps_nal().len());
    }

    #[test]
    fn calculate_ue_len_matches_actual_patch_field_width() {
        // sanity check that the helper used to size precisions agrees with put_ue
        assert_eq!(calculate_ue_len(0), 1);
        assert_eq!(calculate_ue_len(1), 3);
    }
}
