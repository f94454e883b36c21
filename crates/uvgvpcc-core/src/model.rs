//! The pipeline's core data types: points, patches, frames, GOFs and the
//! output chunk record. Bitstream-syntax types (VPS, atlas context) live in
//! their own modules and are referenced here by `Option`, populated as a
//! GOF's jobs progress through the pipeline.

use crate::atlas::AtlasContext;
use crate::vps::Vps;

/// An integer 3D point coordinate, in voxel units up to `geoBitDepthInput` bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Point3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// An 8-bit-per-channel colour attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// A single point cloud sample: position plus colour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColoredPoint {
    pub position: Point3,
    pub color: Rgb,
}

/// A rectangular region projected from the point cloud onto one of the six
/// projection planes.
#[derive(Debug, Clone, Default)]
pub struct Patch {
    /// Projection plane id, `0..=5`.
    pub patch_ppi: u8,
    pub pos_u: u32,
    pub pos_v: u32,
    pub pos_d: u32,
    /// 3D range along the projection (depth) axis.
    pub range_d: u32,
    pub width_in_pixel: u32,
    pub height_in_pixel: u32,
    pub width_in_occ_blk: u32,
    pub height_in_occ_blk: u32,
    /// Placement on the atlas, in occupancy-block units.
    pub om_ds_pos_x: u32,
    pub om_ds_pos_y: u32,
    pub axis_swap: bool,
    /// Binary occupancy bitmap, `width_in_pixel * height_in_pixel` entries.
    pub occupancy: Vec<bool>,
    /// Index of the matching patch in the previous frame, if any.
    pub best_match_idx: Option<usize>,
    /// Index of the union patch this one was merged into during inter packing.
    pub union_patch_reference_idx: Option<usize>,
}

impl Patch {
    /// `width_in_occ_blk * occupancy_map_ds_resolution == width_in_pixel`, and
    /// the patch's occupancy-block placement fits within the downsampled map.
    pub fn check_invariants(&self, occupancy_map_ds_resolution: u32, map_width: u32, map_height: u32) -> bool {
        let ds_width = map_width / occupancy_map_ds_resolution;
        let ds_height = map_height / occupancy_map_ds_resolution;
        self.width_in_occ_blk * occupancy_map_ds_resolution == self.width_in_pixel
            && self.height_in_occ_blk * occupancy_map_ds_resolution == self.height_in_pixel
            && self.om_ds_pos_x + self.width_in_occ_blk <= ds_width
            && self.om_ds_pos_y + self.height_in_occ_blk <= ds_height
    }
}

/// One input point cloud, in ingest order.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub id: usize,
    pub geo_bit_depth_input: u32,
    pub points: Vec<ColoredPoint>,
    pub patches: Vec<Patch>,
    pub occupancy_map: Vec<u8>,
    pub geometry_layer1: Vec<u8>,
    pub geometry_layer2: Option<Vec<u8>>,
    pub attribute_layer1: Vec<u8>,
    pub attribute_layer2: Option<Vec<u8>>,
    /// Final map height, a multiple of 8 and of the occupancy downsample
    /// block size; filled in once packing completes.
    pub map_height: u32,
}

impl Frame {
    pub fn new(id: usize, geo_bit_depth_input: u32) -> Self {
        Self {
            id,
            geo_bit_depth_input,
            ..Default::default()
        }
    }

    /// Drop points whose coordinates do not fit in `geo_bit_depth_input`
    /// bits, returning how many were dropped.
    pub fn clip_out_of_range_points(&mut self) -> usize {
        let limit = (1u64 << self.geo_bit_depth_input) as u32;
        let before = self.points.len();
        self.points.retain(|p| {
            p.position.x < limit && p.position.y < limit && p.position.z < limit
        });
        before - self.points.len()
    }
}

/// A borrowed view of one frame's 2D planes, passed to a [`crate::encoder::VideoEncoder2d`].
#[derive(Debug, Clone, Copy)]
pub struct FrameMap<'a> {
    pub width: u32,
    pub height: u32,
    pub occupancy: &'a [u8],
    pub geometry_layer1: &'a [u8],
    pub geometry_layer2: Option<&'a [u8]>,
    pub attribute_layer1: &'a [u8],
    pub attribute_layer2: Option<&'a [u8]>,
}

/// A group of up to `sizeGOF` consecutive frames, muxed into one V3C chunk.
#[derive(Debug, Default)]
pub struct Gof {
    pub gof_id: u32,
    pub frames: Vec<Frame>,
    /// Max `map_height` across constituent frames, selected after packing.
    pub map_height: u32,
    pub vps: Option<Vps>,
    pub atlas_context: Option<AtlasContext>,
    pub ovd: Option<Vec<u8>>,
    pub gvd: Option<Vec<u8>>,
    pub avd: Option<Vec<u8>>,
}

impl Gof {
    pub fn new(gof_id: u32) -> Self {
        Self {
            gof_id,
            ..Default::default()
        }
    }

    /// `vps_v3c_parameter_set_id = gofId mod 16`.
    pub fn vps_parameter_set_id(&self) -> u8 {
        (self.gof_id % 16) as u8
    }
}

/// An output record: an owned byte buffer plus the ordered sizes of the V3C
/// units it contains. `unit_sizes` must sum to `data.len()`.
#[derive(Debug, Clone, Default)]
pub struct V3cChunk {
    pub data: Vec<u8>,
    pub unit_sizes: Vec<usize>,
}

impl V3cChunk {
    pub fn payload_len_matches_unit_sizes(&self) -> bool {
        self.unit_sizes.iter().sum::<usize>() == self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_out_of_range_points_drops_overflowing_coordinates() {
        let mut frame = Frame::new(0, 4); // limit = 16
        frame.points.push(ColoredPoint {
            position: Point3 { x: 1, y: 1, z: 1 },
            color: Rgb::default(),
        });
        frame.points.push(ColoredPoint {
            position: Point3 { x: 16, y: 0, z: 0 },
            color: Rgb::default(),
        });
        let dropped = frame.clip_out_of_range_points();
        assert_eq!(dropped, 1);
        assert_eq!(frame.points.len(), 1);
    }

    #[test]
    fn gof_parameter_set_id_wraps_at_16() {
        let gof = Gof::new(17);
        assert_eq!(gof.vps_parameter_set_id(), 1);
    }

    #[test]
    fn patch_invariant_checks_occupancy_block_alignment() {
        let patch = Patch {
            width_in_pixel: 32,
            height_in_pixel: 16,
            width_in_occ_blk: 4,
            height_in_occ_blk: 2,
            om_ds_pos_x: 0,
            om_ds_pos_y: 0,
            ..Default::default()
        };
        assert!(patch.check_invariants(8, 64, 64));
        assert!(!patch.check_invariants(4, 64, 64));
    }

    #[test]
    fn chunk_unit_sizes_must_sum_to_payload_length() {
        let good = V3cChunk {
            data: vec![0u8; 10],
            unit_sizes: vec![4, 6],
        };
        assert!(good.payload_len_matches_unit_sizes());
        let bad = V3cChunk {
            data: vec![0u8; 10],
            unit_sizes: vec![4, 5],
        };
        assert!(!bad.payload_len_matches_unit_sizes());
    }
}
