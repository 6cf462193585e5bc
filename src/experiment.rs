//! Declarative ramp/hold experiment profiles.
//!
//! A [`StagePlan`] maps elapsed run time to exactly one stage and one
//! target rate. The mapping depends only on elapsed time, never on how
//! many scheduler ticks have happened, so it cannot drift.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::protocol::{MAX_RATE_UL_MIN, MIN_RATE_UL_MIN};

/// One segment of an experiment. Rates are µL/min, durations whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentStage {
    Ramp {
        from_rate: u16,
        to_rate: u16,
        duration_secs: u32,
    },
    Hold {
        rate: u16,
        duration_secs: u32,
    },
}

impl ExperimentStage {
    pub fn ramp(from_rate: u16, to_rate: u16, duration_secs: u32) -> Self {
        ExperimentStage::Ramp {
            from_rate,
            to_rate,
            duration_secs,
        }
    }

    pub fn hold(rate: u16, duration_secs: u32) -> Self {
        ExperimentStage::Hold {
            rate,
            duration_secs,
        }
    }

    /// Ramp with a duration in (possibly fractional) minutes.
    pub fn ramp_minutes(from_rate: u16, to_rate: u16, minutes: f64) -> Result<Self> {
        Ok(Self::ramp(from_rate, to_rate, minutes_to_secs(minutes)?))
    }

    /// Hold with a duration in (possibly fractional) minutes.
    pub fn hold_minutes(rate: u16, minutes: f64) -> Result<Self> {
        Ok(Self::hold(rate, minutes_to_secs(minutes)?))
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.duration_secs()))
    }

    pub fn duration_secs(&self) -> u32 {
        match *self {
            ExperimentStage::Ramp { duration_secs, .. } => duration_secs,
            ExperimentStage::Hold { duration_secs, .. } => duration_secs,
        }
    }

    pub fn start_rate(&self) -> u16 {
        match *self {
            ExperimentStage::Ramp { from_rate, .. } => from_rate,
            ExperimentStage::Hold { rate, .. } => rate,
        }
    }

    pub fn end_rate(&self) -> u16 {
        match *self {
            ExperimentStage::Ramp { to_rate, .. } => to_rate,
            ExperimentStage::Hold { rate, .. } => rate,
        }
    }

    /// Target rate at `offset` into this stage, rounded to the nearest µL/min.
    ///
    /// Offsets past the end are clamped to the stage's terminal rate.
    pub fn rate_at(&self, offset: Duration) -> u16 {
        match *self {
            ExperimentStage::Hold { rate, .. } => rate,
            ExperimentStage::Ramp {
                from_rate,
                to_rate,
                duration_secs,
            } => {
                let total = f64::from(duration_secs);
                let fraction = (offset.as_secs_f64() / total).clamp(0.0, 1.0);
                let from = f64::from(from_rate);
                let span = f64::from(to_rate) - from;
                (from + span * fraction).round() as u16
            }
        }
    }

    fn validate(&self, index: usize) -> Result<()> {
        if self.duration_secs() == 0 {
            return Err(DriverError::InvalidPlan(format!(
                "stage {index} has zero duration"
            )));
        }
        for rate in [self.start_rate(), self.end_rate()] {
            if !(MIN_RATE_UL_MIN..=MAX_RATE_UL_MIN).contains(&rate) {
                return Err(DriverError::InvalidPlan(format!(
                    "stage {index} rate {rate} µL/min outside [{MIN_RATE_UL_MIN}, {MAX_RATE_UL_MIN}]"
                )));
            }
        }
        Ok(())
    }
}

fn minutes_to_secs(minutes: f64) -> Result<u32> {
    let secs = (minutes * 60.0).round();
    if !secs.is_finite() || secs < 0.0 || secs > f64::from(u32::MAX) {
        return Err(DriverError::InvalidPlan(format!(
            "stage duration {minutes} min is not representable"
        )));
    }
    Ok(secs as u32)
}

/// Where a run stands at a given elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanPosition {
    Active {
        stage_index: usize,
        /// Elapsed time at which this stage started.
        stage_start: Duration,
        rate: u16,
    },
    /// Elapsed time is at or past the plan's end.
    Finished { final_rate: u16 },
}

/// A validated, non-empty sequence of stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<ExperimentStage>,
}

impl StagePlan {
    /// Rejects empty lists, zero-length stages, and out-of-range rates.
    ///
    /// Adjacent stages need not share a boundary rate.
    pub fn new(stages: Vec<ExperimentStage>) -> Result<Self> {
        if stages.is_empty() {
            return Err(DriverError::InvalidPlan("stage list is empty".into()));
        }
        for (i, stage) in stages.iter().enumerate() {
            stage.validate(i)?;
        }
        Ok(Self { stages })
    }

    /// Hold at the initial rate, ramp up, hold, ramp down.
    pub fn standard_profile(
        initial_rate: u16,
        initial_minutes: f64,
        ramp_up_rate: u16,
        ramp_up_minutes: f64,
        hold_minutes: f64,
        ramp_down_rate: u16,
        ramp_down_minutes: f64,
    ) -> Result<Self> {
        Self::new(vec![
            ExperimentStage::hold_minutes(initial_rate, initial_minutes)?,
            ExperimentStage::ramp_minutes(initial_rate, ramp_up_rate, ramp_up_minutes)?,
            ExperimentStage::hold_minutes(ramp_up_rate, hold_minutes)?,
            ExperimentStage::ramp_minutes(ramp_up_rate, ramp_down_rate, ramp_down_minutes)?,
        ])
    }

    pub fn stages(&self) -> &[ExperimentStage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(ExperimentStage::duration).sum()
    }

    /// Terminal rate of the last stage.
    pub fn final_rate(&self) -> u16 {
        // Non-empty by construction.
        self.stages.last().map_or(MIN_RATE_UL_MIN, |s| s.end_rate())
    }

    /// Map elapsed run time to a stage and target rate.
    pub fn position(&self, elapsed: Duration) -> PlanPosition {
        let mut stage_start = Duration::ZERO;
        for (stage_index, stage) in self.stages.iter().enumerate() {
            let stage_end = stage_start + stage.duration();
            if elapsed < stage_end {
                return PlanPosition::Active {
                    stage_index,
                    stage_start,
                    rate: stage.rate_at(elapsed - stage_start),
                };
            }
            stage_start = stage_end;
        }
        PlanPosition::Finished {
            final_rate: self.final_rate(),
        }
    }

    /// Convenience over [`position`](Self::position).
    pub fn rate_at(&self, elapsed: Duration) -> u16 {
        match self.position(elapsed) {
            PlanPosition::Active { rate, .. } => rate,
            PlanPosition::Finished { final_rate } => final_rate,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let profile: Vec<ProfileStage> = serde_json::from_str(json)?;
        Self::from_profile(&profile)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_profile(profile: &[ProfileStage]) -> Result<Self> {
        let stages = profile
            .iter()
            .map(ProfileStage::to_stage)
            .collect::<Result<Vec<_>>>()?;
        Self::new(stages)
    }

    pub fn to_profile(&self) -> Vec<ProfileStage> {
        self.stages.iter().map(ProfileStage::from).collect()
    }
}

/// On-disk stage format; durations are minutes.
///
/// ```json
/// [
///   {"type": "static", "rate": 500, "duration": 5},
///   {"type": "ramp", "start_rate": 500, "end_rate": 1000, "duration": 10}
/// ]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProfileStage {
    #[serde(alias = "hold")]
    Static { rate: u16, duration: f64 },
    Ramp {
        start_rate: u16,
        end_rate: u16,
        duration: f64,
    },
}

impl ProfileStage {
    fn to_stage(&self) -> Result<ExperimentStage> {
        match *self {
            ProfileStage::Static { rate, duration } => ExperimentStage::hold_minutes(rate, duration),
            ProfileStage::Ramp {
                start_rate,
                end_rate,
                duration,
            } => ExperimentStage::ramp_minutes(start_rate, end_rate, duration),
        }
    }
}

impl From<&ExperimentStage> for ProfileStage {
    fn from(stage: &ExperimentStage) -> Self {
        let minutes = f64::from(stage.duration_secs()) / 60.0;
        match *stage {
            ExperimentStage::Hold { rate, .. } => ProfileStage::Static {
                rate,
                duration: minutes,
            },
            ExperimentStage::Ramp {
                from_rate, to_rate, ..
            } => ProfileStage::Ramp {
                start_rate: from_rate,
                end_rate: to_rate,
                duration: minutes,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn ramp_interpolates_exactly() {
        let ramp = ExperimentStage::ramp(500, 1000, 600);
        assert_eq!(ramp.rate_at(secs(0)), 500);
        assert_eq!(ramp.rate_at(secs(300)), 750);
        assert_eq!(ramp.rate_at(secs(600)), 1000);
    }

    #[test]
    fn ramp_rounds_to_nearest() {
        let down = ExperimentStage::ramp(1000, 500, 600);
        // 1000 - 500 * 599/600 = 500.83
        assert_eq!(down.rate_at(secs(599)), 501);
        let up = ExperimentStage::ramp(1, 2, 2);
        assert_eq!(up.rate_at(secs(1)), 2); // 1.5 rounds up
    }

    #[test]
    fn hold_is_constant() {
        let hold = ExperimentStage::hold(1234, 60);
        assert_eq!(hold.rate_at(secs(0)), 1234);
        assert_eq!(hold.rate_at(secs(59)), 1234);
    }

    #[test]
    fn three_stage_plan() {
        let plan = StagePlan::new(vec![
            ExperimentStage::ramp_minutes(500, 1000, 10.0).unwrap(),
            ExperimentStage::hold_minutes(1000, 10.0).unwrap(),
            ExperimentStage::ramp_minutes(1000, 500, 10.0).unwrap(),
        ])
        .unwrap();

        assert_eq!(plan.total_duration(), secs(1800));
        assert_eq!(plan.rate_at(secs(600)), 1000);
        assert_eq!(plan.rate_at(secs(900)), 1000);
        let near_end = plan.rate_at(secs(1799));
        assert!(near_end.abs_diff(500) <= 1, "got {near_end}");
        assert_eq!(
            plan.position(secs(1800)),
            PlanPosition::Finished { final_rate: 500 }
        );
        assert_eq!(
            plan.position(secs(650)),
            PlanPosition::Active {
                stage_index: 1,
                stage_start: secs(600),
                rate: 1000
            }
        );
    }

    #[test]
    fn boundary_belongs_to_next_stage() {
        let plan = StagePlan::new(vec![
            ExperimentStage::hold(100, 10),
            ExperimentStage::hold(900, 10),
        ])
        .unwrap();
        assert_eq!(plan.rate_at(Duration::from_millis(9_999)), 100);
        assert_eq!(plan.rate_at(secs(10)), 900);
    }

    #[test]
    fn rejects_invalid_plans() {
        assert!(matches!(
            StagePlan::new(vec![]),
            Err(DriverError::InvalidPlan(_))
        ));
        assert!(matches!(
            StagePlan::new(vec![ExperimentStage::hold(500, 0)]),
            Err(DriverError::InvalidPlan(_))
        ));
        assert!(matches!(
            StagePlan::new(vec![ExperimentStage::ramp(0, 500, 10)]),
            Err(DriverError::InvalidPlan(_))
        ));
        assert!(matches!(
            StagePlan::new(vec![ExperimentStage::ramp(500, 10_001, 10)]),
            Err(DriverError::InvalidPlan(_))
        ));
        assert!(ExperimentStage::hold_minutes(500, -1.0).is_err());
    }

    #[test]
    fn discontinuous_boundaries_are_legal() {
        let plan = StagePlan::new(vec![
            ExperimentStage::ramp(500, 1000, 60),
            ExperimentStage::hold(200, 60),
        ]);
        assert!(plan.is_ok());
    }

    #[test]
    fn standard_profile_layout() {
        let plan = StagePlan::standard_profile(100, 1.0, 1000, 2.0, 3.0, 200, 0.5).unwrap();
        assert_eq!(
            plan.stages(),
            &[
                ExperimentStage::hold(100, 60),
                ExperimentStage::ramp(100, 1000, 120),
                ExperimentStage::hold(1000, 180),
                ExperimentStage::ramp(1000, 200, 30),
            ]
        );
        assert_eq!(plan.final_rate(), 200);
    }

    #[test]
    fn parses_profile_json() {
        let json = r#"[
            {"type": "static", "rate": 500, "duration": 0.5},
            {"type": "ramp", "start_rate": 500, "end_rate": 1000, "duration": 10},
            {"type": "hold", "rate": 1000, "duration": 1}
        ]"#;
        let plan = StagePlan::from_json(json).unwrap();
        assert_eq!(
            plan.stages(),
            &[
                ExperimentStage::hold(500, 30),
                ExperimentStage::ramp(500, 1000, 600),
                ExperimentStage::hold(1000, 60),
            ]
        );

        let back = StagePlan::from_profile(&plan.to_profile()).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn bad_profile_json() {
        assert!(matches!(
            StagePlan::from_json(r#"[{"type": "pulse", "rate": 5}]"#),
            Err(DriverError::Json(_))
        ));
        assert!(matches!(
            StagePlan::from_json("[]"),
            Err(DriverError::InvalidPlan(_))
        ));
    }
}
