//! Library parameter surface: `set_parameter` string parsing, preset/rate
//! expansion, and the freeze-on-initialize validation pass.

use crate::error::{EncoderError, Result};

/// Patch-packing mode. `Ra` enables inter-GOF patch packing by default;
/// `Ai` keeps every frame intra-packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Ra,
    Ai,
}

impl std::str::FromStr for Mode {
    type Err = EncoderError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RA" => Ok(Mode::Ra),
            "AI" => Ok(Mode::Ai),
            other => Err(EncoderError::Configuration(format!(
                "unknown mode '{other}', expected RA or AI"
            ))),
        }
    }
}

/// The full write-once parameter block. Mutated only through `set_parameter`
/// before `freeze`; read-only afterwards, so no lock is required once the
/// encoder is initialized.
#[derive(Debug, Clone)]
pub struct Parameters {
    pub geo_bit_depth_input: Option<u32>,
    pub preset_name: String,
    pub rate: Option<String>,

    pub occupancy_qp: u32,
    pub geometry_qp: u32,
    pub attribute_qp: u32,
    pub occupancy_map_ds_resolution: u32,

    pub mode: Mode,
    pub inter_patch_packing_override: Option<bool>,

    pub size_gof: usize,
    pub size_gop_2d_encoding: usize,
    pub max_concurrent_frames: usize,
    pub intra_frame_period: usize,

    pub map_width: u32,
    pub minimum_map_height: u32,

    pub nb_thread_pc_part: usize,
    pub occupancy_encoding_nb_thread: usize,
    pub geometry_encoding_nb_thread: usize,
    pub attribute_encoding_nb_thread: usize,

    pub occupancy_encoder_name: String,
    pub geometry_encoder_name: String,
    pub attribute_encoder_name: String,
    pub occupancy_encoding_format: String,
    pub geometry_encoding_format: String,
    pub attribute_encoding_format: String,
    pub occupancy_encoding_is_lossless: bool,
    pub geometry_encoding_is_lossless: bool,
    pub attribute_encoding_is_lossless: bool,

    pub double_layer: bool,
    pub low_delay_bitstream: bool,
    pub timer_log: bool,
    pub log_level: String,
    pub errors_are_fatal: bool,
    pub export_intermediate_files: bool,
    pub intermediate_files_dir: Option<String>,
    pub intermediate_files_dir_time_stamp: bool,
    pub gpa_treshold_iou: f64,
    pub min_level: u32,
    pub log2_quantizer_size_x: u32,
    pub log2_quantizer_size_y: u32,
    pub surface_thickness: u32,
    pub space_patch_packing: bool,

    frozen: bool,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            geo_bit_depth_input: None,
            preset_name: "fast".to_string(),
            rate: None,
            occupancy_qp: 32,
            geometry_qp: 32,
            attribute_qp: 32,
            occupancy_map_ds_resolution: 4,
            mode: Mode::Ra,
            inter_patch_packing_override: None,
            size_gof: 32,
            size_gop_2d_encoding: 32,
            max_concurrent_frames: 32,
            intra_frame_period: 32,
            map_width: 1024,
            minimum_map_height: 1024,
            nb_thread_pc_part: 0,
            occupancy_encoding_nb_thread: 1,
            geometry_encoding_nb_thread: 1,
            attribute_encoding_nb_thread: 1,
            occupancy_encoder_name: "kvazaar".to_string(),
            geometry_encoder_name: "kvazaar".to_string(),
            attribute_encoder_name: "kvazaar".to_string(),
            occupancy_encoding_format: "YUV420".to_string(),
            geometry_encoding_format: "YUV420".to_string(),
            attribute_encoding_format: "YUV420".to_string(),
            occupancy_encoding_is_lossless: true,
            geometry_encoding_is_lossless: false,
            attribute_encoding_is_lossless: false,
            double_layer: false,
            low_delay_bitstream: false,
            timer_log: false,
            log_level: "info".to_string(),
            errors_are_fatal: true,
            export_intermediate_files: false,
            intermediate_files_dir: None,
            intermediate_files_dir_time_stamp: false,
            gpa_treshold_iou: 0.3,
            min_level: 1,
            log2_quantizer_size_x: 2,
            log2_quantizer_size_y: 2,
            surface_thickness: 4,
            space_patch_packing: false,
            frozen: false,
        }
    }
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether inter-GOF patch packing is enabled: an explicit
    /// `interPatchPacking` override wins, else it follows `mode == RA`.
    pub fn inter_patch_packing(&self) -> bool {
        self.inter_patch_packing_override
            .unwrap_or(self.mode == Mode::Ra)
    }

    /// `nbThreadPCPart == 0` resolves to the host's hardware concurrency.
    pub fn worker_thread_count(&self) -> usize {
        if self.nb_thread_pc_part == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.nb_thread_pc_part
        }
    }

    /// Parse one `name=value` pair. Only callable before `freeze`.
    pub fn set_parameter(&mut self, name: &str, value: &str) -> Result<()> {
        if self.frozen {
            return Err(EncoderError::Configuration(
                "set_parameter called after initialize_encoder".to_string(),
            ));
        }
        match name {
            "geoBitDepthInput" => self.geo_bit_depth_input = Some(parse(name, value)?),
            "presetName" => self.preset_name = value.to_string(),
            "rate" => self.rate = Some(value.to_string()),
            "mode" => self.mode = value.parse()?,
            "interPatchPacking" => self.inter_patch_packing_override = Some(parse_bool(name, value)?),
            "sizeGOF" => self.size_gof = parse(name, value)?,
            "sizeGOP2DEncoding" => self.size_gop_2d_encoding = parse(name, value)?,
            "maxConcurrentFrames" => self.max_concurrent_frames = parse(name, value)?,
            "intraFramePeriod" => self.intra_frame_period = parse(name, value)?,
            "mapWidth" => self.map_width = parse(name, value)?,
            "minimumMapHeight" => self.minimum_map_height = parse(name, value)?,
            "occupancyMapDSResolution" => self.occupancy_map_ds_resolution = parse(name, value)?,
            "nbThreadPCPart" => self.nb_thread_pc_part = parse(name, value)?,
            "occupancyEncodingNbThread" => self.occupancy_encoding_nb_thread = parse(name, value)?,
            "geometryEncodingNbThread" => self.geometry_encoding_nb_thread = parse(name, value)?,
            "attributeEncodingNbThread" => self.attribute_encoding_nb_thread = parse(name, value)?,
            "occupancyEncoderName" => self.occupancy_encoder_name = value.to_string(),
            "geometryEncoderName" => self.geometry_encoder_name = value.to_string(),
            "attributeEncoderName" => self.attribute_encoder_name = value.to_string(),
            "occupancyEncodingFormat" => self.occupancy_encoding_format = reject_yuv400(name, value)?,
            "geometryEncodingFormat" => self.geometry_encoding_format = reject_yuv400(name, value)?,
            "attributeEncodingFormat" => self.attribute_encoding_format = reject_yuv400(name, value)?,
            "occupancyEncodingQp" => self.occupancy_qp = parse(name, value)?,
            "geometryEncodingQp" => self.geometry_qp = parse(name, value)?,
            "attributeEncodingQp" => self.attribute_qp = parse(name, value)?,
            "occupancyEncodingIsLossless" => self.occupancy_encoding_is_lossless = parse_bool(name, value)?,
            "geometryEncodingIsLossless" => self.geometry_encoding_is_lossless = parse_bool(name, value)?,
            "attributeEncodingIsLossless" => self.attribute_encoding_is_lossless = parse_bool(name, value)?,
            "doubleLayer" => self.double_layer = parse_bool(name, value)?,
            "lowDelayBitstream" => self.low_delay_bitstream = parse_bool(name, value)?,
            "timerLog" => self.timer_log = parse_bool(name, value)?,
            "logLevel" => self.log_level = value.to_string(),
            "errorsAreFatal" => self.errors_are_fatal = parse_bool(name, value)?,
            "exportIntermediateFiles" => self.export_intermediate_files = parse_bool(name, value)?,
            "intermediateFilesDir" => self.intermediate_files_dir = Some(value.to_string()),
            "intermediateFilesDirTimeStamp" => {
                self.intermediate_files_dir_time_stamp = parse_bool(name, value)?
            }
            "gpaTresholdIoU" => self.gpa_treshold_iou = parse(name, value)?,
            "minLevel" => self.min_level = parse(name, value)?,
            "log2QuantizerSizeX" => self.log2_quantizer_size_x = parse(name, value)?,
            "log2QuantizerSizeY" => self.log2_quantizer_size_y = parse(name, value)?,
            "surfaceThickness" => self.surface_thickness = parse(name, value)?,
            "spacePatchPacking" => self.space_patch_packing = parse_bool(name, value)?,
            other => {
                return Err(EncoderError::Configuration(format!(
                    "unknown parameter '{other}'"
                )))
            }
        }
        Ok(())
    }

    /// Expand `rate = "G-A-O"` into geometry QP / attribute QP / occupancy
    /// downsample resolution, if set.
    fn expand_rate(&mut self) -> Result<()> {
        let Some(rate) = self.rate.clone() else {
            return Ok(());
        };
        let parts: Vec<&str> = rate.split('-').collect();
        if parts.len() != 3 {
            return Err(EncoderError::Configuration(format!(
                "rate '{rate}' must have the form G-A-O"
            )));
        }
        self.geometry_qp = parse("rate.geometryQP", parts[0])?;
        self.attribute_qp = parse("rate.attributeQP", parts[1])?;
        self.occupancy_map_ds_resolution = parse("rate.occupancyMapDSResolution", parts[2])?;
        Ok(())
    }

    /// Freeze and validate the parameter block; called once by
    /// `initialize_encoder`.
    pub fn freeze(&mut self) -> Result<()> {
        if self.frozen {
            return Err(EncoderError::Configuration(
                "initialize_encoder called twice".to_string(),
            ));
        }
        self.expand_rate()?;
        if self.geo_bit_depth_input.is_none() {
            return Err(EncoderError::Configuration(
                "geoBitDepthInput is required".to_string(),
            ));
        }
        if self.size_gof > self.max_concurrent_frames {
            return Err(EncoderError::Configuration(format!(
                "sizeGOF ({}) must not exceed maxConcurrentFrames ({})",
                self.size_gof, self.max_concurrent_frames
            )));
        }
        check_multiple_of_8_and_ds(
            "mapWidth",
            self.map_width,
            self.occupancy_map_ds_resolution,
        )?;
        check_multiple_of_8_and_ds(
            "minimumMapHeight",
            self.minimum_map_height,
            self.occupancy_map_ds_resolution,
        )?;
        self.frozen = true;
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

fn reject_yuv400(name: &str, value: &str) -> Result<String> {
    if value.eq_ignore_ascii_case("YUV400") {
        return Err(EncoderError::Configuration(format!(
            "{name}: YUV400 is not supported"
        )));
    }
    Ok(value.to_string())
}

fn check_multiple_of_8_and_ds(name: &str, value: u32, ds: u32) -> Result<()> {
    if !value.is_multiple_of(8) || !value.is_multiple_of(ds) {
        return Err(EncoderError::Configuration(format!(
            "{name} ({value}) must be a multiple of 8 and of occupancyMapDSResolution ({ds})"
        )));
    }
    Ok(())
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        EncoderError::Configuration(format!("invalid value '{value}' for parameter '{name}'"))
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(EncoderError::Configuration(format!(
            "invalid boolean '{other}' for parameter '{name}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qp_parameters_set_independent_fields() {
        let mut p = Parameters::new();
        p.set_parameter("geoBitDepthInput", "10").unwrap();
        p.set_parameter("occupancyEncodingQp", "12").unwrap();
        p.set_parameter("geometryEncodingQp", "24").unwrap();
        p.set_parameter("attributeEncodingQp", "36").unwrap();
        p.freeze().unwrap();
        assert_eq!(p.occupancy_qp, 12);
        assert_eq!(p.geometry_qp, 24);
        assert_eq!(p.attribute_qp, 36);
    }

    #[test]
    fn rate_expands_into_three_fields() {
        let mut p = Parameters::new();
        p.set_parameter("geoBitDepthInput", "10").unwrap();
        p.set_parameter("rate", "28-30-4").unwrap();
        p.freeze().unwrap();
        assert_eq!(p.geometry_qp, 28);
        assert_eq!(p.attribute_qp, 30);
        assert_eq!(p.occupancy_map_ds_resolution, 4);
    }

    #[test]
    fn freeze_requires_geo_bit_depth() {
        let mut p = Parameters::new();
        assert!(p.freeze().is_err());
    }

    #[test]
    fn freeze_rejects_gof_larger_than_in_flight_bound() {
        let mut p = Parameters::new();
        p.set_parameter("geoBitDepthInput", "10").unwrap();
        p.set_parameter("sizeGOF", "8").unwrap();
        p.set_parameter("maxConcurrentFrames", "2").unwrap();
        assert!(p.freeze().is_err());
    }

    #[test]
    fn freeze_rejects_non_multiple_of_8_dimensions() {
        let mut p = Parameters::new();
        p.set_parameter("geoBitDepthInput", "10").unwrap();
        p.set_parameter("mapWidth", "1023").unwrap();
        assert!(p.freeze().is_err());
    }

    #[test]
    fn unknown_parameter_is_an_error() {
        let mut p = Parameters::new();
        assert!(p.set_parameter("notAKey", "1").is_err());
    }

    #[test]
    fn yuv400_format_is_rejected() {
        let mut p = Parameters::new();
        assert!(p.set_parameter("occupancyEncodingFormat", "YUV400").is_err());
    }

    #[test]
    fn set_parameter_after_freeze_fails() {
        let mut p = Parameters::new();
        p.set_parameter("geoBitDepthInput", "10").unwrap();
        p.freeze().unwrap();
        assert!(p.set_parameter("sizeGOF", "4").is_err());
    }

    #[test]
    fn inter_patch_packing_follows_mode_by_default() {
        let mut p = Parameters::new();
        p.set_parameter("mode", "AI").unwrap();
        assert!(!p.inter_patch_packing());
        p.set_parameter("mode", "RA").unwrap();
        assert!(p.inter_patch_packing());
    }

    #[test]
    fn inter_patch_packing_override_wins() {
        let mut p = Parameters::new();
        p.set_parameter("mode", "RA").unwrap();
        p.set_parameter("interPatchPacking", "false").unwrap();
        assert!(!p.inter_patch_packing());
    }
}
