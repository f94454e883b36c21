//! The public `Encoder` API: the parameter surface, the three collaborator
//! traits the real patch generator / packer / 2D codecs sit behind, and the
//! per-frame DAG construction that wires jobs onto the scheduler.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::atlas::AtlasContext;
use crate::error::{EncoderError, Result};
use crate::model::{Frame, FrameMap, Gof, Rgb};
use crate::mux::{mux_classical, mux_low_delay};
use crate::parameters::Parameters;
use crate::scheduler::{JobId, Scheduler};
use crate::sync::{OutputQueue, Semaphore};
use crate::vps::Vps;

/// Produces patches for one frame from its point cloud.
pub trait PatchGenerator: Send + Sync {
    fn generate(&self, frame: &mut Frame, params: &Parameters);
}

/// Places patches onto the shared occupancy map, either one frame at a time
/// (`AI` mode) or jointly across a GOF (`RA` mode).
pub trait PatchPacker: Send + Sync {
    fn pack_intra(&self, frame: &mut Frame, params: &Parameters);
    fn pack_inter(&self, gof: &mut Gof, params: &Parameters);
}

/// Encodes one video plane (occupancy, geometry or attribute) for a GOF's
/// frames into that plane's 2D-codec sample stream.
pub trait VideoEncoder2d: Send + Sync {
    fn encode(&self, frames: &[FrameMap<'_>], params: &Parameters) -> Result<Vec<u8>>;
}

/// Minimal-but-conforming collaborator set: no real packer or video codec is
/// linked in. Used by the test suite and the CLI's `--dummy-run` flag to
/// exercise the pipeline and muxer end to end.
pub struct DummyRun;

impl PatchGenerator for DummyRun {
    fn generate(&self, frame: &mut Frame, _params: &Parameters) {
        if frame.points.is_empty() {
            return;
        }
        frame.patches.push(crate::model::Patch {
            patch_ppi: 0,
            pos_u: 0,
            pos_v: 0,
            pos_d: 0,
            range_d: 1,
            width_in_pixel: 8,
            height_in_pixel: 8,
            width_in_occ_blk: 1,
            height_in_occ_blk: 1,
            om_ds_pos_x: 0,
            om_ds_pos_y: 0,
            axis_swap: false,
            occupancy: vec![true; 64],
            best_match_idx: None,
            union_patch_reference_idx: None,
        });
    }
}

impl PatchPacker for DummyRun {
    fn pack_intra(&self, frame: &mut Frame, params: &Parameters) {
        frame.map_height = params.minimum_map_height;
    }

    fn pack_inter(&self, gof: &mut Gof, params: &Parameters) {
        for frame in &mut gof.frames {
            frame.map_height = params.minimum_map_height;
        }
    }
}

impl VideoEncoder2d for DummyRun {
    /// One placeholder NAL per frame, already in the 4-byte length-prefixed
    /// sample stream form a real 2D encoder's output would be converted to.
    fn encode(&self, frames: &[FrameMap<'_>], _params: &Parameters) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(frames.len() * 5);
        for _ in frames {
            out.extend_from_slice(&1u32.to_be_bytes());
            out.push(0);
        }
        Ok(out)
    }
}

/// Stamp each of a frame's packed patches into its occupancy/geometry/
/// attribute planes. Not a named collaborator contract: a real encoder's
/// rasterization lives behind whatever packer produced the patches, but the
/// pipeline still needs concrete plane buffers to hand the 2D encoders.
fn rasterize_frame(frame: &mut Frame, params: &Parameters) {
    let width = params.map_width;
    let height = frame.map_height.max(params.minimum_map_height);
    let size = (width * height) as usize;

    frame.occupancy_map = vec![0u8; size];
    frame.geometry_layer1 = vec![0u8; size];
    frame.attribute_layer1 = vec![0u8; size * 3];
    if params.double_layer {
        frame.geometry_layer2 = Some(vec![0u8; size]);
        frame.attribute_layer2 = Some(vec![0u8; size * 3]);
    }

    let fill_color = frame
        .points
        .first()
        .map(|p| p.color)
        .unwrap_or(Rgb { r: 128, g: 128, b: 128 });
    let ds = params.occupancy_map_ds_resolution;

    for patch in &frame.patches {
        let ox = patch.om_ds_pos_x * ds;
        let oy = patch.om_ds_pos_y * ds;
        for py in 0..patch.height_in_pixel {
            for px in 0..patch.width_in_pixel {
                let bit = (py * patch.width_in_pixel + px) as usize;
                if !patch.occupancy.get(bit).copied().unwrap_or(false) {
                    continue;
                }
                let (x, y) = (ox + px, oy + py);
                if x >= width || y >= height {
                    continue;
                }
                let i = (y * width + x) as usize;
                frame.occupancy_map[i] = 255;
                frame.geometry_layer1[i] = patch.pos_d.min(255) as u8;
                frame.attribute_layer1[i * 3] = fill_color.r;
                frame.attribute_layer1[i * 3 + 1] = fill_color.g;
                frame.attribute_layer1[i * 3 + 2] = fill_color.b;
            }
        }
    }
}

/// The GOF-scope jobs created when a GOF's first frame arrives. `inter_pack`
/// is absent when `interPatchPacking` is off.
struct GofJobs {
    inter_pack: Option<JobId>,
    init_map_gen: JobId,
    encode_2d: JobId,
    mux: JobId,
}

#[derive(Default)]
struct PipelineState {
    gof: Option<Arc<Mutex<Gof>>>,
    gof_jobs: Option<GofJobs>,
    frames_in_gof: usize,
    next_gof_id: u32,
    prev_mux_job: Option<JobId>,
}

/// The uvgVPCCenc library entry point. `Encoder::new` accepts only
/// `set_parameter` until `initialize_encoder` freezes the configuration and
/// starts the worker pool.
pub struct Encoder {
    params: Mutex<Parameters>,
    frozen_params: Mutex<Option<Arc<Parameters>>>,
    patch_generator: Arc<dyn PatchGenerator>,
    patch_packer: Arc<dyn PatchPacker>,
    occupancy_encoder: Arc<dyn VideoEncoder2d>,
    geometry_encoder: Arc<dyn VideoEncoder2d>,
    attribute_encoder: Arc<dyn VideoEncoder2d>,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    in_flight: Mutex<Option<Arc<Semaphore>>>,
    output: Arc<OutputQueue>,
    pipeline: Mutex<PipelineState>,
}

impl Encoder {
    pub fn new(
        patch_generator: Arc<dyn PatchGenerator>,
        patch_packer: Arc<dyn PatchPacker>,
        occupancy_encoder: Arc<dyn VideoEncoder2d>,
        geometry_encoder: Arc<dyn VideoEncoder2d>,
        attribute_encoder: Arc<dyn VideoEncoder2d>,
    ) -> Self {
        Self {
            params: Mutex::new(Parameters::new()),
            frozen_params: Mutex::new(None),
            patch_generator,
            patch_packer,
            occupancy_encoder,
            geometry_encoder,
            attribute_encoder,
            scheduler: Mutex::new(None),
            in_flight: Mutex::new(None),
            output: Arc::new(OutputQueue::new()),
            pipeline: Mutex::new(PipelineState::default()),
        }
    }

    /// Convenience constructor wiring [`DummyRun`] for all three
    /// collaborators: the CLI's `--dummy-run` path and the test suite's seed
    /// scenarios use this.
    pub fn new_dummy_run() -> Self {
        let dummy = Arc::new(crate::encoder::DummyRun);
        Self::new(dummy.clone(), dummy.clone(), dummy.clone(), dummy.clone(), dummy)
    }

    pub fn set_parameter(&self, name: &str, value: &str) -> Result<()> {
        self.params.lock().set_parameter(name, value)
    }

    pub fn initialize_encoder(&self) -> Result<()> {
        let mut params = self.params.lock();
        params.freeze()?;
        let worker_count = params.worker_thread_count();
        let max_in_flight = params.max_concurrent_frames as isize;
        let frozen = Arc::new(params.clone());
        drop(params);

        *self.frozen_params.lock() = Some(frozen);
        *self.scheduler.lock() = Some(Scheduler::new(worker_count));
        *self.in_flight.lock() = Some(Arc::new(Semaphore::new(max_in_flight)));
        Ok(())
    }

    /// The queue chunks are pushed to as each GOF's `Mux` job completes.
    /// [`empty_frame_queue`](Self::empty_frame_queue) closes it once the
    /// trailing GOF has been muxed, so a consumer should drain it with
    /// [`OutputQueue::pop_until_closed`] rather than [`OutputQueue::pop`].
    pub fn output_queue(&self) -> Arc<OutputQueue> {
        Arc::clone(&self.output)
    }

    fn scheduler(&self) -> Result<Arc<Scheduler>> {
        self.scheduler.lock().clone().ok_or_else(|| {
            EncoderError::Configuration("encode_frame called before initialize_encoder".to_string())
        })
    }

    fn frozen_params(&self) -> Result<Arc<Parameters>> {
        self.frozen_params.lock().clone().ok_or_else(|| {
            EncoderError::Configuration("encode_frame called before initialize_encoder".to_string())
        })
    }

    /// Acquire the in-flight slot, construct/extend the current GOF's jobs,
    /// and submit the frame-level ones. Submits the GOF-level jobs once the
    /// GOF reaches `sizeGOF` frames.
    pub fn encode_frame(&self, mut frame: Frame) -> Result<()> {
        let scheduler = self.scheduler()?;
        let params = self.frozen_params()?;
        let in_flight = self
            .in_flight
            .lock()
            .clone()
            .expect("set alongside the scheduler in initialize_encoder");
        in_flight.acquire();

        let dropped = frame.clip_out_of_range_points();
        if dropped > 0 {
            tracing::warn!(
                target: "BITSTREAM GENERATION",
                frame_id = frame.id,
                dropped,
                "dropped out-of-range points"
            );
        }

        let mut pipeline = self.pipeline.lock();
        if pipeline.gof.is_none() {
            self.start_gof(&mut pipeline, &scheduler, &params);
        }

        let gof = Arc::clone(pipeline.gof.as_ref().expect("just started above"));
        let idx = {
            let mut g = gof.lock();
            g.frames.push(frame);
            g.frames.len() - 1
        };

        {
            let gof_jobs = pipeline.gof_jobs.as_ref().expect("just started above");
            self.wire_frame_jobs(&scheduler, &gof, idx, gof_jobs, &params);
        }

        pipeline.frames_in_gof += 1;
        if pipeline.frames_in_gof == params.size_gof {
            self.submit_gof(&mut pipeline, &scheduler);
        }
        Ok(())
    }

    /// Submit the trailing (possibly short) GOF and block until its `Mux`
    /// job completes.
    pub fn empty_frame_queue(&self) -> Result<()> {
        let scheduler = self.scheduler()?;
        let mut pipeline = self.pipeline.lock();
        if pipeline.frames_in_gof > 0 {
            self.submit_gof(&mut pipeline, &scheduler);
        }
        let last_mux = pipeline.prev_mux_job;
        drop(pipeline);
        if let Some(job) = last_mux {
            scheduler.wait_for_job(job)?;
        }
        self.output.close();
        Ok(())
    }

    fn start_gof(&self, pipeline: &mut PipelineState, scheduler: &Arc<Scheduler>, params: &Arc<Parameters>) {
        let gof_id = pipeline.next_gof_id;
        pipeline.next_gof_id += 1;
        let gof = Arc::new(Mutex::new(Gof::new(gof_id)));
        let inter = params.inter_patch_packing();

        let inter_pack = if inter {
            let gof_ip = Arc::clone(&gof);
            let packer = Arc::clone(&self.patch_packer);
            let params_ip = Arc::clone(params);
            Some(scheduler.create_job(format!("InterPack({gof_id})"), 3, move || {
                let mut g = gof_ip.lock();
                packer.pack_inter(&mut g, &params_ip);
                Ok(())
            }))
        } else {
            None
        };

        let init_map_gen = {
            let gof_mg = Arc::clone(&gof);
            let params_mg = Arc::clone(params);
            scheduler.create_job(format!("InitMapGen({gof_id})"), 3, move || {
                let mut g = gof_mg.lock();
                let height = g
                    .frames
                    .iter()
                    .map(|f| f.map_height)
                    .max()
                    .unwrap_or(params_mg.minimum_map_height);
                g.map_height = height.max(params_mg.minimum_map_height);
                Ok(())
            })
        };
        if let Some(ip) = inter_pack {
            scheduler.add_dependency(init_map_gen, ip);
        }

        let encode_2d = {
            let gof_e2d = Arc::clone(&gof);
            let params_e2d = Arc::clone(params);
            let occ = Arc::clone(&self.occupancy_encoder);
            let geo = Arc::clone(&self.geometry_encoder);
            let attr = Arc::clone(&self.attribute_encoder);
            scheduler.create_job(format!("Encode2D({gof_id})"), 4, move || {
                let (ovd, gvd, avd) = {
                    let g = gof_e2d.lock();
                    let frame_maps: Vec<FrameMap<'_>> = g
                        .frames
                        .iter()
                        .map(|f| FrameMap {
                            width: params_e2d.map_width,
                            height: f.map_height,
                            occupancy: &f.occupancy_map,
                            geometry_layer1: &f.geometry_layer1,
                            geometry_layer2: f.geometry_layer2.as_deref(),
                            attribute_layer1: &f.attribute_layer1,
                            attribute_layer2: f.attribute_layer2.as_deref(),
                        })
                        .collect();
                    (
                        occ.encode(&frame_maps, &params_e2d)?,
                        geo.encode(&frame_maps, &params_e2d)?,
                        attr.encode(&frame_maps, &params_e2d)?,
                    )
                };
                let mut g = gof_e2d.lock();
                g.ovd = Some(ovd);
                g.gvd = Some(gvd);
                g.avd = Some(avd);
                Ok(())
            })
        };
        scheduler.add_dependency(encode_2d, init_map_gen);

        let mux = {
            let gof_mux = Arc::clone(&gof);
            let params_mux = Arc::clone(params);
            let output = Arc::clone(&self.output);
            let in_flight = self
                .in_flight
                .lock()
                .clone()
                .expect("set alongside the scheduler in initialize_encoder");
            scheduler.create_job(format!("Mux({gof_id})"), 5, move || {
                let frame_count = {
                    let mut g = gof_mux.lock();
                    g.vps = Some(Vps::build(&g, &params_mux)?);
                    g.atlas_context = Some(AtlasContext::build(&g, &params_mux)?);
                    let muxed = if params_mux.low_delay_bitstream {
                        mux_low_delay(&g, params_mux.double_layer)?
                    } else {
                        mux_classical(&g)?
                    };
                    output.push(muxed);
                    g.frames.len()
                };
                for _ in 0..frame_count {
                    in_flight.release();
                }
                Ok(())
            })
        };
        scheduler.add_dependency(mux, encode_2d);
        if let Some(prev) = pipeline.prev_mux_job {
            scheduler.add_dependency(mux, prev);
        }
        pipeline.prev_mux_job = Some(mux);

        pipeline.gof = Some(gof);
        pipeline.gof_jobs = Some(GofJobs {
            inter_pack,
            init_map_gen,
            encode_2d,
            mux,
        });
        pipeline.frames_in_gof = 0;
    }

    fn wire_frame_jobs(
        &self,
        scheduler: &Arc<Scheduler>,
        gof: &Arc<Mutex<Gof>>,
        idx: usize,
        gof_jobs: &GofJobs,
        params: &Arc<Parameters>,
    ) {
        let inter = params.inter_patch_packing();

        let gen = Arc::clone(&self.patch_generator);
        let gof_pg = Arc::clone(gof);
        let params_pg = Arc::clone(params);
        let patch_gen = scheduler.create_job(format!("PatchGen({idx})"), 1, move || {
            let mut g = gof_pg.lock();
            gen.generate(&mut g.frames[idx], &params_pg);
            Ok(())
        });

        if inter {
            scheduler.add_dependency(
                gof_jobs.inter_pack.expect("inter mode always creates InterPack"),
                patch_gen,
            );
        } else {
            let alloc_om = scheduler.create_job(format!("AllocOM({idx})"), 1, || Ok(()));
            scheduler.add_dependency(alloc_om, patch_gen);

            let packer = Arc::clone(&self.patch_packer);
            let gof_ip = Arc::clone(gof);
            let params_ip = Arc::clone(params);
            let intra_pack = scheduler.create_job(format!("IntraPack({idx})"), 1, move || {
                let mut g = gof_ip.lock();
                packer.pack_intra(&mut g.frames[idx], &params_ip);
                Ok(())
            });
            scheduler.add_dependency(intra_pack, alloc_om);
            scheduler.add_dependency(gof_jobs.init_map_gen, intra_pack);

            scheduler.submit(alloc_om);
            scheduler.submit(intra_pack);
        }
        scheduler.submit(patch_gen);

        let gof_fm = Arc::clone(gof);
        let params_fm = Arc::clone(params);
        let gen_frame_maps = scheduler.create_job(format!("GenFrameMaps({idx})"), 2, move || {
            let mut g = gof_fm.lock();
            rasterize_frame(&mut g.frames[idx], &params_fm);
            Ok(())
        });
        scheduler.add_dependency(gen_frame_maps, gof_jobs.init_map_gen);
        scheduler.add_dependency(gof_jobs.encode_2d, gen_frame_maps);
        scheduler.submit(gen_frame_maps);
    }

    fn submit_gof(&self, pipeline: &mut PipelineState, scheduler: &Arc<Scheduler>) {
        if let Some(jobs) = pipeline.gof_jobs.take() {
            if let Some(ip) = jobs.inter_pack {
                scheduler.submit(ip);
            }
            scheduler.submit(jobs.init_map_gen);
            scheduler.submit(jobs.encode_2d);
            scheduler.submit(jobs.mux);
        }
        pipeline.gof = None;
        pipeline.frames_in_gof = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColoredPoint, Point3};

    fn sample_frame(id: usize) -> Frame {
        let mut frame = Frame::new(id, 8);
        frame.points.push(ColoredPoint {
            position: Point3 { x: 1, y: 2, z: 3 },
            color: Rgb { r: 10, g: 20, b: 30 },
        });
        frame
    }

    fn dummy_encoder() -> Encoder {
        let encoder = Encoder::new_dummy_run();
        encoder.set_parameter("geoBitDepthInput", "8").unwrap();
        encoder.set_parameter("sizeGOF", "2").unwrap();
        encoder.set_parameter("maxConcurrentFrames", "2").unwrap();
        encoder.set_parameter("mode", "AI").unwrap();
        encoder
    }

    #[test]
    fn full_gof_produces_one_chunk() {
        let encoder = dummy_encoder();
        encoder.initialize_encoder().unwrap();
        let output = encoder.output_queue();

        encoder.encode_frame(sample_frame(0)).unwrap();
        encoder.encode_frame(sample_frame(1)).unwrap();
        encoder.empty_frame_queue().unwrap();

        let chunk = output.pop();
        assert!(chunk.chunk.payload_len_matches_unit_sizes());
        assert_eq!(chunk.chunk.unit_sizes.len(), 5);
    }

    #[test]
    fn trailing_short_gof_is_flushed_by_empty_frame_queue() {
        let encoder = dummy_encoder();
        encoder.initialize_encoder().unwrap();
        let output = encoder.output_queue();

        encoder.encode_frame(sample_frame(0)).unwrap();
        encoder.empty_frame_queue().unwrap();

        assert_eq!(output.len(), 1);
    }

    #[test]
    fn encode_frame_before_initialize_is_an_error() {
        let encoder = dummy_encoder();
        assert!(encoder.encode_frame(sample_frame(0)).is_err());
    }

    #[test]
    fn two_gofs_arrive_in_order() {
        let encoder = dummy_encoder();
        encoder.initialize_encoder().unwrap();
        let output = encoder.output_queue();

        for i in 0..4 {
            encoder.encode_frame(sample_frame(i)).unwrap();
        }
        encoder.empty_frame_queue().unwrap();

        let first = output.pop();
        let second = output.pop();
        assert_eq!(first.chunk.unit_sizes.len(), 5);
        assert_eq!(second.chunk.unit_sizes.len(), 5);
    }
}
