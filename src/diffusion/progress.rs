//! Progress state machine (§4.3.4). Stage transitions are detected by substring
//! match against the child's stdout — kept as a data table per §9's "Stage-
//! detection fragility" note, not hard-coded match arms, so engine version
//! drift only requires editing this table.

use super::registry::Stage;
use regex::Regex;
use std::time::{Duration, Instant};

/// Initial calibration defaults (§4.3.4).
const DEFAULT_MODEL_LOAD_MS: f64 = 2000.0;
const DEFAULT_DIFFUSION_MS_PER_STEP_PER_MP: f64 = 1000.0;
const DEFAULT_VAE_MS_PER_MP: f64 = 8000.0;

/// The detection table — substring → transition. Kept as data, not hard-coded
/// `if` chains, so it can be swapped for a different engine's output format.
pub struct DetectionTable {
    pub loading_start: &'static str,
    pub diffusion_start: &'static [&'static str],
    pub decoding_start: &'static str,
    pub decoding_end: &'static str,
    pub step_bar: Regex,
}

impl Default for DetectionTable {
    fn default() -> Self {
        Self {
            loading_start: "loading tensors from",
            diffusion_start: &["generating image:", "sampling using"],
            decoding_start: "decoding 1 latents",
            decoding_end: "decode_first_stage completed",
            step_bar: Regex::new(r"\|\s*(\d+)\s*/\s*(\d+)\s*-").unwrap(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Calibration {
    model_load_ms: f64,
    diffusion_ms_per_step_per_mp: f64,
    vae_ms_per_mp: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            model_load_ms: DEFAULT_MODEL_LOAD_MS,
            diffusion_ms_per_step_per_mp: DEFAULT_DIFFUSION_MS_PER_STEP_PER_MP,
            vae_ms_per_mp: DEFAULT_VAE_MS_PER_MP,
        }
    }
}

/// Owns the tunable constants across generations (§4.3.4). One instance per
/// diffusion server — calibration learned from one job informs the estimate
/// for the next.
#[derive(Clone, Copy)]
pub struct TimeEstimator {
    calibration: Calibration,
}

impl Default for TimeEstimator {
    fn default() -> Self {
        Self {
            calibration: Calibration::default(),
        }
    }
}

impl TimeEstimator {
    pub fn estimate_total_ms(&self, steps: u32, megapixels: f64) -> f64 {
        self.calibration.model_load_ms
            + steps as f64 * megapixels * self.calibration.diffusion_ms_per_step_per_mp
            + megapixels * self.calibration.vae_ms_per_mp
    }

    /// Recalibrates constants from a completed job's measured stage durations.
    /// Only constants with a measured stage are overwritten — §4.3.4: "if
    /// exactly two of three stages were measured, infer the third from
    /// total_wall_clock − measured_stages − inter_stage_gaps."
    pub fn calibrate(&mut self, measured: &MeasuredStages, steps: u32, megapixels: f64) {
        let mut load_ms = measured.load_ms;
        let mut diffusion_ms = measured.diffusion_ms;
        let mut decode_ms = measured.decode_ms;

        let measured_count = [load_ms, diffusion_ms, decode_ms]
            .iter()
            .filter(|m| m.is_some())
            .count();

        if measured_count == 2 {
            if let Some(total) = measured.total_wall_clock_ms {
                if load_ms.is_none() {
                    load_ms = Some(
                        total - diffusion_ms.unwrap_or(0.0) - decode_ms.unwrap_or(0.0),
                    );
                } else if diffusion_ms.is_none() {
                    diffusion_ms =
                        Some(total - load_ms.unwrap_or(0.0) - decode_ms.unwrap_or(0.0));
                } else if decode_ms.is_none() {
                    decode_ms =
                        Some(total - load_ms.unwrap_or(0.0) - diffusion_ms.unwrap_or(0.0));
                }
            }
        }

        if let Some(ms) = load_ms {
            self.calibration.model_load_ms = ms.max(0.0);
        }
        if let Some(ms) = diffusion_ms {
            if steps > 0 && megapixels > 0.0 {
                self.calibration.diffusion_ms_per_step_per_mp =
                    (ms / (steps as f64 * megapixels)).max(0.0);
            }
        }
        if let Some(ms) = decode_ms {
            if megapixels > 0.0 {
                self.calibration.vae_ms_per_mp = (ms / megapixels).max(0.0);
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MeasuredStages {
    pub load_ms: Option<f64>,
    pub diffusion_ms: Option<f64>,
    pub decode_ms: Option<f64>,
    pub total_wall_clock_ms: Option<f64>,
}

/// Drives stage transitions from stdout chunks for one in-flight job.
pub struct ProgressTracker {
    table: DetectionTable,
    stage: Option<Stage>,
    started_at: Instant,
    load_started_at: Option<Instant>,
    load_ended_at: Option<Instant>,
    diffusion_ended_at: Option<Instant>,
    decode_ended_at: Option<Instant>,
    current_step: u32,
    total_steps: u32,
    megapixels: f64,
    total_estimate_ms: f64,
}

pub struct ProgressUpdate {
    pub stage: Stage,
    pub current_step: u32,
    pub total_steps: u32,
    pub percentage: f32,
}

impl ProgressTracker {
    pub fn new(estimator: &TimeEstimator, steps: u32, width: u32, height: u32) -> Self {
        let megapixels = (width as f64 * height as f64) / 1_000_000.0;
        Self {
            table: DetectionTable::default(),
            stage: None,
            started_at: Instant::now(),
            load_started_at: None,
            load_ended_at: None,
            diffusion_ended_at: None,
            decode_ended_at: None,
            current_step: 0,
            total_steps: steps,
            megapixels,
            total_estimate_ms: estimator.estimate_total_ms(steps, megapixels),
        }
    }

    /// Feeds one line of child stdout, returns a progress update if the line
    /// caused a transition or a step-bar match.
    pub fn on_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        let lower = line.to_lowercase();

        if self.stage.is_none() && lower.contains(self.table.loading_start) {
            self.stage = Some(Stage::Loading);
            self.load_started_at = Some(Instant::now());
        } else if matches!(self.stage, Some(Stage::Loading))
            && self
                .table
                .diffusion_start
                .iter()
                .any(|m| lower.contains(m))
        {
            self.load_ended_at = Some(Instant::now());
            self.stage = Some(Stage::Diffusion);
            // loading -> diffusion transition recalculates the remaining
            // estimate from the actual loading duration (§4.3.4).
            self.recalculate_with_actual_load();
        } else if matches!(self.stage, Some(Stage::Diffusion)) && lower.contains(self.table.decoding_start) {
            self.diffusion_ended_at = Some(Instant::now());
            // diffusion -> decoding transition recalculates the remaining
            // estimate from the actual diffusion duration, same as the
            // loading -> diffusion transition above (§4.3.4).
            self.recalculate_with_actual_diffusion(self.total_steps);
            self.stage = Some(Stage::Decoding);
            self.current_step = 0;
            self.total_steps = 0;
        } else if matches!(self.stage, Some(Stage::Decoding)) && lower.contains(self.table.decoding_end) {
            self.decode_ended_at = Some(Instant::now());
            return Some(ProgressUpdate {
                stage: Stage::Decoding,
                current_step: 0,
                total_steps: 0,
                percentage: 100.0,
            });
        }

        if let Some(caps) = self.table.step_bar.captures(line) {
            if let (Ok(cur), Ok(total)) = (
                caps[1].parse::<u32>(),
                caps[2].parse::<u32>(),
            ) {
                self.current_step = cur;
                self.total_steps = total;
            }
        }

        let stage = self.stage?;
        Some(ProgressUpdate {
            stage,
            current_step: self.current_step,
            total_steps: self.total_steps,
            percentage: self.percentage(),
        })
    }

    fn recalculate_with_actual_load(&mut self) {
        if let (Some(start), Some(end)) = (self.load_started_at, self.load_ended_at) {
            let actual_load_ms = end.duration_since(start).as_secs_f64() * 1000.0;
            // replace the load portion of the estimate with the actual value
            // to avoid clamping to 100% early if the default was too low.
            let remaining_estimate = self.total_estimate_ms - DEFAULT_MODEL_LOAD_MS;
            self.total_estimate_ms = actual_load_ms + remaining_estimate.max(0.0);
        }
    }

    fn recalculate_with_actual_diffusion(&mut self, steps: u32) {
        if let (Some(start), Some(end)) = (self.load_ended_at, self.diffusion_ended_at) {
            let actual_diffusion_ms = end.duration_since(start).as_secs_f64() * 1000.0;
            // replace the diffusion portion of the estimate with the actual
            // value, same reasoning as recalculate_with_actual_load.
            let default_diffusion_ms =
                steps as f64 * self.megapixels * DEFAULT_DIFFUSION_MS_PER_STEP_PER_MP;
            let remaining_estimate = self.total_estimate_ms - default_diffusion_ms;
            self.total_estimate_ms = actual_diffusion_ms + remaining_estimate.max(0.0);
        }
    }

    fn percentage(&self) -> f32 {
        let elapsed_ms = self.started_at.elapsed().as_secs_f64() * 1000.0;
        if self.total_estimate_ms <= 0.0 {
            return 0.0;
        }
        ((elapsed_ms / self.total_estimate_ms) * 100.0).clamp(0.0, 100.0) as f32
    }

    /// Synthetic VAE progress percentage during decoding (§4.3.4): ticked
    /// every 100ms by the caller's `unref`ed timer until the completion
    /// substring arrives or the process exits.
    pub fn synthetic_decoding_percentage(&self) -> f32 {
        self.percentage()
    }

    pub fn measured_stages(&self) -> MeasuredStages {
        let load_ms = match (self.load_started_at, self.load_ended_at) {
            (Some(s), Some(e)) => Some(e.duration_since(s).as_secs_f64() * 1000.0),
            _ => None,
        };
        let diffusion_ms = match (self.load_ended_at, self.diffusion_ended_at) {
            (Some(s), Some(e)) => Some(e.duration_since(s).as_secs_f64() * 1000.0),
            _ => None,
        };
        let decode_ms = match (self.diffusion_ended_at, self.decode_ended_at) {
            (Some(s), Some(e)) => Some(e.duration_since(s).as_secs_f64() * 1000.0),
            _ => None,
        };
        MeasuredStages {
            load_ms,
            diffusion_ms,
            decode_ms,
            total_wall_clock_ms: Some(self.started_at.elapsed().as_secs_f64() * 1000.0),
        }
    }

    pub fn megapixels(&self) -> f64 {
        self.megapixels
    }
}

/// Synthetic VAE timer: emits decoding progress at ~100ms intervals. The
/// caller must drop the returned handle (or abort it) when the completion
/// marker or process exit arrives — it never blocks process shutdown since
/// it's a plain tokio interval, not a raw OS timer.
pub fn spawn_vae_timer(
    tracker: std::sync::Arc<parking_lot::Mutex<ProgressTracker>>,
    on_tick: impl Fn(f32) + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            interval.tick().await;
            let pct = tracker.lock().synthetic_decoding_percentage();
            on_tick(pct);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_loading_then_diffusion_then_decoding() {
        let estimator = TimeEstimator::default();
        let mut tracker = ProgressTracker::new(&estimator, 20, 512, 512);

        let u1 = tracker.on_line("loading tensors from model.gguf").unwrap();
        assert_eq!(u1.stage, Stage::Loading);

        let u2 = tracker.on_line("sampling using euler_a").unwrap();
        assert_eq!(u2.stage, Stage::Diffusion);

        let u3 = tracker.on_line("| 10 / 20 -").unwrap();
        assert_eq!(u3.current_step, 10);
        assert_eq!(u3.total_steps, 20);

        let u4 = tracker.on_line("decoding 1 latents").unwrap();
        assert_eq!(u4.stage, Stage::Decoding);

        let u5 = tracker.on_line("decode_first_stage completed").unwrap();
        assert_eq!(u5.percentage, 100.0);
    }

    #[test]
    fn ignores_unrelated_lines() {
        let estimator = TimeEstimator::default();
        let mut tracker = ProgressTracker::new(&estimator, 20, 512, 512);
        assert!(tracker.on_line("some unrelated log line").is_none());
    }

    #[test]
    fn calibration_updates_only_measured_constants() {
        let mut estimator = TimeEstimator::default();
        let measured = MeasuredStages {
            load_ms: Some(1500.0),
            diffusion_ms: None,
            decode_ms: Some(4000.0),
            total_wall_clock_ms: None,
        };
        let before = estimator.calibration.diffusion_ms_per_step_per_mp;
        estimator.calibrate(&measured, 20, 0.25);
        assert_eq!(estimator.calibration.model_load_ms, 1500.0);
        assert_eq!(estimator.calibration.diffusion_ms_per_step_per_mp, before);
        assert_eq!(estimator.calibration.vae_ms_per_mp, 16000.0);
    }

    #[test]
    fn calibration_infers_third_stage_from_two_measured() {
        let mut estimator = TimeEstimator::default();
        let measured = MeasuredStages {
            load_ms: Some(1000.0),
            diffusion_ms: None,
            decode_ms: Some(2000.0),
            total_wall_clock_ms: Some(10000.0),
        };
        estimator.calibrate(&measured, 10, 1.0);
        assert_eq!(estimator.calibration.diffusion_ms_per_step_per_mp, 700.0);
    }

    #[test]
    fn estimate_scales_with_steps_and_megapixels() {
        let estimator = TimeEstimator::default();
        let small = estimator.estimate_total_ms(10, 0.25);
        let large = estimator.estimate_total_ms(20, 1.0);
        assert!(large > small);
    }
}
