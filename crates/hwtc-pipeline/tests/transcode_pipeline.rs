use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hwtc_codec::dynamic_rc::DynamicRcRule;
use hwtc_codec::config::RateControlMode;
use hwtc_codec::reference::{ReferenceOpener, StatsHandle};
use hwtc_core::codec_traits::DecodePath;
use hwtc_core::context::DeferredStream;
use hwtc_core::error::Result;
use hwtc_core::types::{Chapter, Rational, TrimList, TrimWindow};
use hwtc_device::probe::TableProber;
use hwtc_pipeline::file_sink::{Collected, MemorySink};
use hwtc_pipeline::filter_chain::{AfsOptions, YadifOptions};
use hwtc_pipeline::job::{InputConfig, TranscodeJob};
use hwtc_pipeline::pipeline::{RunReport, TranscodePipeline};
use hwtc_pipeline::plan::plan;
use hwtc_pipeline::sync::SyncMode;
use hwtc_pipeline::synthetic::{SyntheticSpec, SyntheticTiming};

struct Outcome {
    result: Result<RunReport>,
    packets: Arc<Mutex<Collected>>,
    stats: StatsHandle,
}

async fn run_with(job: &TranscodeJob, opener: ReferenceOpener, sink: MemorySink, pipeline: TranscodePipeline) -> Outcome {
    let source = job.input.open().unwrap();
    let planned = plan(job, source.as_ref(), &TableProber::reference(), &HashMap::new()).unwrap();
    let packets = sink.collected();
    let stats = opener.stats();
    let result = pipeline
        .run(planned, source, Box::new(opener), Box::new(sink))
        .await;
    Outcome {
        result,
        packets,
        stats,
    }
}

async fn run(job: &TranscodeJob) -> Outcome {
    let pipeline = TranscodePipeline::new(job.runtime.pipeline_config());
    run_with(job, ReferenceOpener::new(), MemorySink::new(), pipeline).await
}

fn job(spec: SyntheticSpec) -> TranscodeJob {
    TranscodeJob {
        input: InputConfig::Synthetic(spec),
        ..TranscodeJob::default()
    }
}

fn trim(windows: &[(u64, u64)]) -> TrimList {
    TrimList::new(
        windows
            .iter()
            .map(|&(start, end)| TrimWindow { start, end })
            .collect(),
        0,
    )
    .unwrap()
}

#[tokio::test]
async fn trimmed_ntsc_1080p_emits_exactly_the_window() {
    let mut j = job(SyntheticSpec::default());
    j.trim = trim(&[(50, 150)]);
    let out = run(&j).await;
    let report = out.result.unwrap();

    assert_eq!(report.frames_read, 300);
    assert_eq!(report.frames_trimmed, 200);
    assert_eq!(report.frames_submitted, 100);
    assert_eq!(report.frames_encoded, 100);
    assert_eq!(report.timebase, Some(Rational::new(1001, 120_000).unwrap()));

    let c = out.packets.lock().unwrap();
    assert_eq!(c.packets.len(), 100);
    assert_eq!(c.flushes, 1);
    let first = c.packets.iter().min_by_key(|p| p.frame_index).unwrap();
    assert_eq!(first.pts, 0);
    assert!(first.is_keyframe);
    assert!(c.packets.iter().all(|p| p.duration == 4));

    let st = out.stats.lock().unwrap();
    assert_eq!(st.timestamps.first(), Some(&0));
    assert!(st.timestamps.windows(2).all(|w| w[1] - w[0] == 4));
    assert!(st.eos_sent);
    assert!(st.destroyed);
}

#[tokio::test]
async fn every_trim_window_contributes_its_frames() {
    let mut j = job(SyntheticSpec {
        frames: 120,
        ..SyntheticSpec::default()
    });
    j.trim = trim(&[(0, 5), (10, 20), (100, 200)]);
    let report = run(&j).await.result.unwrap();
    assert_eq!(report.frames_read, 120);
    assert_eq!(report.frames_submitted, 5 + 10 + 20);
    assert_eq!(report.frames_trimmed, 120 - 35);
}

#[tokio::test]
async fn vfr_trim_keeps_timeline_continuous() {
    let mut j = job(SyntheticSpec {
        frames: 60,
        ..SyntheticSpec::default()
    });
    j.sync.mode = SyncMode::Vfr;
    j.trim = trim(&[(10, 20), (40, 45)]);
    let out = run(&j).await;
    let report = out.result.unwrap();
    assert_eq!(report.trim_shift, 80);
    let st = out.stats.lock().unwrap();
    let expected: Vec<i64> = (0..15).map(|i| i * 4).collect();
    assert_eq!(st.timestamps, expected);
}

#[tokio::test]
async fn force_cfr_duplicates_slow_source() {
    let mut j = job(SyntheticSpec {
        frames: 200,
        timing: SyntheticTiming::Scaled { num: 3, den: 2 },
        ..SyntheticSpec::default()
    });
    j.sync.mode = SyncMode::ForceCfr;
    let out = run(&j).await;
    let report = out.result.unwrap();
    assert_eq!(report.frames_duplicated, 99);
    assert_eq!(report.frames_submitted, 299);
    let ratio = report.frames_duplicated as f64 / 200.0;
    assert!((ratio - 0.5).abs() < 0.02, "ratio {ratio}");
    let st = out.stats.lock().unwrap();
    assert!(st.timestamps.windows(2).all(|w| w[1] - w[0] == 4));
}

#[tokio::test]
async fn vfr_passthrough_timestamps_never_decrease() {
    let mut j = job(SyntheticSpec {
        frames: 120,
        timebase: Some(Rational::new(1, 90_000).unwrap()),
        timing: SyntheticTiming::Jitter { amplitude: 1000 },
        decode: DecodePath::Hardware,
        ..SyntheticSpec::default()
    });
    j.sync.mode = SyncMode::Vfr;
    let out = run(&j).await;
    assert_eq!(out.result.unwrap().frames_submitted, 120);
    let st = out.stats.lock().unwrap();
    assert_eq!(st.timestamps[0], 0);
    assert!(st.timestamps.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn pool_bounds_mapped_slots_over_long_stream() {
    let j = job(SyntheticSpec {
        frames: 500,
        width: 1280,
        height: 720,
        ..SyntheticSpec::default()
    });
    let out = run(&j).await;
    let report = out.result.unwrap();
    assert_eq!(report.frames_encoded, 500);
    assert!(report.peak_mapped <= report.pool_capacity);
    assert_eq!(report.forced_retrievals, 500 - report.pool_capacity as u64);
}

#[tokio::test]
async fn dynamic_rc_reconfigures_once_per_transition() {
    let mut j = job(SyntheticSpec {
        frames: 90,
        ..SyntheticSpec::default()
    });
    let rule = |start, end, kbps| DynamicRcRule {
        start,
        end,
        mode: RateControlMode::Cbr,
        qp: None,
        avg_bitrate_kbps: Some(kbps),
        max_bitrate_kbps: None,
        target_quality: None,
    };
    j.dynamic_rc = vec![rule(30, Some(60), 2_000), rule(60, None, 1_000)];
    let out = run(&j).await;
    let report = out.result.unwrap();
    assert_eq!(report.reconfigurations, 2);
    let st = out.stats.lock().unwrap();
    assert_eq!(st.reconfigurations.len(), 2);
    assert!(st.idr_frames.contains(&30));
    assert!(st.idr_frames.contains(&60));
}

#[tokio::test]
async fn chapter_start_forces_one_idr() {
    let j = job(SyntheticSpec {
        chapters: vec![Chapter {
            id: 1,
            start: 1,
            timebase: Rational::new(1, 1).unwrap(),
        }],
        ..SyntheticSpec::default()
    });
    let out = run(&j).await;
    out.result.unwrap();
    assert_eq!(out.stats.lock().unwrap().idr_frames, vec![0, 30]);
}

#[tokio::test]
async fn double_rate_deinterlace_doubles_frames() {
    let mut j = job(SyntheticSpec {
        frames: 30,
        picstruct: hwtc_core::types::PictureStructure::TopFieldFirst,
        ..SyntheticSpec::default()
    });
    j.filters.yadif = Some(YadifOptions { double_rate: true });
    let out = run(&j).await;
    let report = out.result.unwrap();
    assert_eq!(report.frames_submitted, 60);
    let st = out.stats.lock().unwrap();
    assert!(st.timestamps.windows(2).all(|w| w[1] - w[0] == 2));
}

#[test]
fn conflicting_deinterlacers_fail_planning() {
    let mut j = job(SyntheticSpec::default());
    j.filters.yadif = Some(YadifOptions::default());
    j.filters.afs = Some(AfsOptions::default());
    j.filters.field_order = Some(hwtc_core::types::PictureStructure::TopFieldFirst);
    let source = j.input.open().unwrap();
    let err = plan(&j, source.as_ref(), &TableProber::reference(), &HashMap::new())
        .expect_err("two deinterlacers");
    assert_eq!(err.error_code(), 103);
    assert!(err.to_string().contains("only one deinterlacer"));
}

#[tokio::test]
async fn cancelled_run_still_tears_down() {
    let j = job(SyntheticSpec::default());
    let pipeline = TranscodePipeline::new(j.runtime.pipeline_config());
    pipeline.cancel_token().cancel();
    let out = run_with(&j, ReferenceOpener::new(), MemorySink::new(), pipeline).await;
    let err = out.result.expect_err("cancelled");
    assert_eq!(err.error_code(), 501);
    let st = out.stats.lock().unwrap();
    assert!(st.eos_sent);
    assert!(st.destroyed);
    assert_eq!(out.packets.lock().unwrap().flushes, 1);
}

#[tokio::test]
async fn wedged_encoder_times_out_on_eos() {
    let mut j = job(SyntheticSpec {
        frames: 10,
        ..SyntheticSpec::default()
    });
    j.runtime.eos_timeout_ms = 20;
    let pipeline = TranscodePipeline::new(j.runtime.pipeline_config());
    let out = run_with(&j, ReferenceOpener::new().stall_eos(), MemorySink::new(), pipeline).await;
    let err = out.result.expect_err("stalled EOS");
    assert_eq!(err.error_code(), 302);
    assert!(err.to_string().contains("encoder EOS"));
    let c = out.packets.lock().unwrap();
    assert_eq!(c.packets.len(), 10);
    assert_eq!(c.flushes, 1);
}

#[tokio::test]
async fn writer_failure_still_closes_output() {
    let j = job(SyntheticSpec {
        frames: 50,
        ..SyntheticSpec::default()
    });
    let pipeline = TranscodePipeline::new(j.runtime.pipeline_config());
    let out = run_with(&j, ReferenceOpener::new(), MemorySink::new().fail_after(5), pipeline).await;
    let err = out.result.expect_err("writer failure");
    assert_eq!(err.error_code(), 503);
    let c = out.packets.lock().unwrap();
    assert_eq!(c.packets.len(), 5);
    assert_eq!(c.flushes, 1);
    assert!(out.stats.lock().unwrap().destroyed);
}

#[tokio::test]
async fn decode_error_is_fatal_after_partial_output() {
    let j = job(SyntheticSpec {
        frames: 40,
        decode: DecodePath::Hardware,
        fail_at: Some(10),
        ..SyntheticSpec::default()
    });
    let out = run(&j).await;
    let err = out.result.expect_err("decode failure");
    assert_eq!(err.error_code(), 401);
    let c = out.packets.lock().unwrap();
    assert_eq!(c.packets.len(), 10);
    assert_eq!(c.flushes, 1);
}

#[tokio::test]
async fn stalled_input_transfer_times_out() {
    let mut j = job(SyntheticSpec {
        frames: 20,
        ..SyntheticSpec::default()
    });
    j.runtime.pipeline_depth = 2;
    j.runtime.event_timeout_ms = 20;
    let pipeline =
        TranscodePipeline::new(j.runtime.pipeline_config()).with_stream(Arc::new(DeferredStream::new()));
    let out = run_with(&j, ReferenceOpener::new(), MemorySink::new(), pipeline).await;
    let err = out.result.expect_err("transfer never completes");
    assert_eq!(err.error_code(), 302);
    assert!(err.to_string().contains("input transfer"));
    assert_eq!(out.stats.lock().unwrap().submitted, 2);
}

#[tokio::test]
async fn session_open_waits_out_memory_pressure() {
    let mut j = job(SyntheticSpec {
        frames: 5,
        ..SyntheticSpec::default()
    });
    j.runtime.session_retry_secs = 5;
    let pipeline = TranscodePipeline::new(j.runtime.pipeline_config());
    let out = run_with(&j, ReferenceOpener::new().fail_out_of_memory(1), MemorySink::new(), pipeline).await;
    assert_eq!(out.result.unwrap().frames_encoded, 5);
}

#[tokio::test]
async fn session_busy_without_retry_budget() {
    let j = job(SyntheticSpec {
        frames: 5,
        ..SyntheticSpec::default()
    });
    let pipeline = TranscodePipeline::new(j.runtime.pipeline_config());
    let out = run_with(&j, ReferenceOpener::new().fail_out_of_memory(1), MemorySink::new(), pipeline).await;
    let err = out.result.expect_err("busy");
    assert_eq!(err.error_code(), 200);
    assert_eq!(out.packets.lock().unwrap().flushes, 1);
}
