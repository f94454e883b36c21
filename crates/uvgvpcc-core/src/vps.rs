//! V3C Parameter Set construction and writing.

use crate::bitstream::BitWriter;
use crate::error::{EncoderError, Result};
use crate::model::Gof;
use crate::parameters::Parameters;

/// Codec group id as carried in the profile/tier/level and the per-video
/// codec id fields. Selected by matching all three 2D encoder names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecGroup {
    /// HEVC Main10, produced by Kvazaar.
    HevcMain10 = 1,
    /// VVC Main10, produced by uvg266.
    VvcMain10 = 3,
}

impl CodecGroup {
    fn select(params: &Parameters) -> Result<Self> {
        let names = (
            params.occupancy_encoder_name.as_str(),
            params.geometry_encoder_name.as_str(),
            params.attribute_encoder_name.as_str(),
        );
        match names {
            ("kvazaar", "kvazaar", "kvazaar") => Ok(CodecGroup::HevcMain10),
            ("uvg266", "uvg266", "uvg266") => Ok(CodecGroup::VvcMain10),
            _ => Err(EncoderError::Configuration(format!(
                "unsupported 2D encoder combination: occupancy={}, geometry={}, attribute={}",
                names.0, names.1, names.2
            ))),
        }
    }
}

/// Profile/tier/level, fixed fields per the reference encoder's only
/// supported profile.
#[derive(Debug, Clone, Copy)]
pub struct ProfileTierLevel {
    pub tier_flag: bool,
    pub profile_codec_group_idc: CodecGroup,
    pub profile_toolset_idc: u8,
    pub profile_reconstruction_idc: u8,
    pub max_decodes_idc: u8,
    pub level_idc: u8,
    pub num_sub_profiles: u8,
    pub toolset_constraints_present_flag: bool,
}

impl ProfileTierLevel {
    fn new(codec_group: CodecGroup) -> Self {
        Self {
            tier_flag: false,
            profile_codec_group_idc: codec_group,
            profile_toolset_idc: 1, // V-PCC Extended
            profile_reconstruction_idc: 1,
            max_decodes_idc: 15,
            level_idc: 30,
            num_sub_profiles: 0,
            toolset_constraints_present_flag: false,
        }
    }

    fn write(&self, bw: &mut BitWriter) {
        bw.put(self.tier_flag as u64, 1);
        bw.put(self.profile_codec_group_idc as u64, 7);
        bw.put(self.profile_toolset_idc as u64, 8);
        bw.put(self.profile_reconstruction_idc as u64, 8);
        bw.put(self.max_decodes_idc as u64, 4);
        bw.put(self.level_idc as u64, 8);
        bw.put(self.num_sub_profiles as u64, 6);
        bw.put(self.toolset_constraints_present_flag as u64, 1);
    }
}

/// V3C Parameter Set for one GOF. Single atlas, occupancy/geometry/attribute
/// all present, one Texture attribute of dimension 3.
#[derive(Debug, Clone)]
pub struct Vps {
    pub vps_v3c_parameter_set_id: u8,
    pub frame_width: u32,
    pub frame_height: u32,
    pub map_count_minus1: u8,
    pub codec_group: CodecGroup,
    pub ptl: ProfileTierLevel,
}

impl Vps {
    /// Build a VPS from a GOF (for `vps_v3c_parameter_set_id` and frame
    /// dimensions) and the frozen parameter block.
    pub fn build(gof: &Gof, params: &Parameters) -> Result<Self> {
        let codec_group = CodecGroup::select(params)?;
        Ok(Self {
            vps_v3c_parameter_set_id: gof.vps_parameter_set_id(),
            frame_width: params.map_width,
            frame_height: gof.map_height,
            map_count_minus1: params.double_layer as u8,
            codec_group,
            ptl: ProfileTierLevel::new(codec_group),
        })
    }

    /// Write the VPS syntax, byte-aligning at the end. Returns the VPS size
    /// in bytes.
    pub fn write(&self, bw: &mut BitWriter) -> Result<u32> {
        let start = bw.tell();

        bw.put(self.vps_v3c_parameter_set_id as u64, 4);
        bw.put(0, 6); // vps_atlas_count_minus1: single atlas
        bw.put(0, 6); // vps_atlas_id[0]
        bw.put_ue(self.frame_width as u64);
        bw.put_ue(self.frame_height as u64);
        bw.put(self.map_count_minus1 as u64, 4);
        bw.put(0, 1); // vps_multiple_map_streams_present_flag: absolute coding for all maps

        bw.put(1, 1); // vps_occupancy_video_present_flag
        bw.put(1, 1); // vps_geometry_video_present_flag
        bw.put(1, 1); // vps_attribute_video_present_flag

        // occupancy_information
        bw.put(self.codec_group as u64, 8);
        bw.put(0, 8); // oi_lossy_occupancy_compression_threshold
        bw.put(7, 5); // oi_occupancy_2d_bit_depth_minus1
        bw.put(0, 1); // oi_occupancy_MSB_align_flag

        // geometry_information
        bw.put(self.codec_group as u64, 8);
        bw.put(7, 5); // gi_geometry_2d_bit_depth_minus1
        bw.put(0, 1); // gi_geometry_MSB_align_flag
        bw.put_ue(0); // gi_geometry_3d_coordinates_bit_depth_minus1: filled per-GOF by the atlas context, not the VPS

        // attribute_information
        bw.put(1, 7); // ai_attribute_count
        bw.put(0, 4); // ai_attribute_type_id[0]: ATTR_TEXTURE
        bw.put(self.codec_group as u64, 8);
        bw.put(2, 6); // ai_attribute_dimension_minus1[0]: 3 channels
        bw.put(7, 5); // ai_attribute_2d_bit_depth_minus1[0]

        bw.put(0, 1); // vps_extension_present_flag
        self.ptl.write(bw);

        bw.align();
        let bits = bw.tell() - start;
        Ok((bits as u32).div_ceil(8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kvazaar_params(geo_bits: u32) -> Parameters {
        let mut p = Parameters::new();
        p.set_parameter("geoBitDepthInput", &geo_bits.to_string()).unwrap();
        p.freeze().unwrap();
        p
    }

    #[test]
    fn parameter_set_id_tracks_gof_id_mod_16() {
        let params = kvazaar_params(10);
        let mut gof = Gof::new(18);
        gof.map_height = 512;
        let vps = Vps::build(&gof, &params).unwrap();
        assert_eq!(vps.vps_v3c_parameter_set_id, 2);
    }

    #[test]
    fn unsupported_encoder_combination_is_a_configuration_error() {
        let mut params = kvazaar_params(10);
        params.attribute_encoder_name = "uvg266".to_string();
        let gof = Gof::new(0);
        assert!(Vps::build(&gof, &params).is_err());
    }

    #[test]
    fn write_is_byte_aligned_and_reports_matching_size() {
        let params = kvazaar_params(10);
        let mut gof = Gof::new(0);
        gof.map_height = 1024;
        let vps = Vps::build(&gof, &params).unwrap();
        let mut bw = BitWriter::new();
        let reported_len = vps.write(&mut bw).unwrap();
        let bytes = bw.take_chunks().unwrap();
        assert_eq!(bytes.len() as u32, reported_len);
    }
}
