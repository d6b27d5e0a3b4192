//! Frame-range rate-control overrides.
//!
//! Rules cover half-open submission index ranges `[start, end)`. The
//! controller tracks which rule is in force and reconfigures the session,
//! with a forced IDR, exactly when that changes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use hwtc_core::error::{EngineError, Result};

use crate::config::{QpTriplet, RateControl, RateControlMode};
use crate::session::EncoderSession;

/// One override as written in a job file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicRcRule {
    pub start: u64,
    /// Exclusive end; absent or 0 means open-ended.
    #[serde(default)]
    pub end: Option<u64>,
    pub mode: RateControlMode,
    #[serde(default)]
    pub qp: Option<QpTriplet>,
    #[serde(default)]
    pub avg_bitrate_kbps: Option<u32>,
    #[serde(default)]
    pub max_bitrate_kbps: Option<u32>,
    #[serde(default)]
    pub target_quality: Option<u8>,
}

impl DynamicRcRule {
    fn end(&self) -> u64 {
        match self.end {
            None | Some(0) => u64::MAX,
            Some(e) => e,
        }
    }

    fn contains(&self, frame: u64) -> bool {
        self.start <= frame && frame < self.end()
    }

    /// Base parameters with this rule's fields laid over them.
    pub fn apply(&self, base: &RateControl) -> RateControl {
        let mut rc = base.clone();
        rc.mode = self.mode;
        if self.mode == RateControlMode::ConstQp {
            if let Some(qp) = self.qp {
                rc.qp = qp;
            }
            rc.max_bitrate_kbps = 0;
        } else {
            if let Some(avg) = self.avg_bitrate_kbps {
                rc.avg_bitrate_kbps = avg;
            }
            if self.target_quality.is_some() {
                rc.target_quality = self.target_quality;
            }
            if let Some(max) = self.max_bitrate_kbps
                && max > 0
            {
                rc.max_bitrate_kbps = max;
            }
        }
        rc
    }
}

/// Check a rule list without touching any encoder state. Returns the rules
/// ordered by `(start, end)`.
pub fn validate_rules(mut rules: Vec<DynamicRcRule>) -> Result<Vec<DynamicRcRule>> {
    for (i, r) in rules.iter().enumerate() {
        if r.end() <= r.start {
            return Err(EngineError::InvalidDynamicRc(format!(
                "rule #{i} range [{}, {}) is empty",
                r.start,
                r.end()
            )));
        }
        if r.mode != RateControlMode::ConstQp && r.avg_bitrate_kbps == Some(0) {
            return Err(EngineError::InvalidDynamicRc(format!(
                "rule #{i} sets a zero average bitrate"
            )));
        }
    }
    rules.sort_by_key(|r| (r.start, r.end()));
    for pair in rules.windows(2) {
        if pair[1].start < pair[0].end() {
            return Err(EngineError::InvalidDynamicRc(format!(
                "range starting at {} overlaps range [{}, {})",
                pair[1].start,
                pair[0].start,
                pair[0].end()
            )));
        }
    }
    Ok(rules)
}

/// Applies dynamic rules as submission indices advance.
#[derive(Debug)]
pub struct DynamicRcController {
    rules: Vec<DynamicRcRule>,
    base: RateControl,
    applied: Option<usize>,
    current: Arc<RateControl>,
    transitions: u64,
}

impl DynamicRcController {
    pub fn new(rules: Vec<DynamicRcRule>, base: RateControl) -> Result<Self> {
        let rules = validate_rules(rules)?;
        Ok(Self {
            rules,
            current: Arc::new(base.clone()),
            base,
            applied: None,
            transitions: 0,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Index of the rule covering `frame`, if any.
    pub fn select(&self, frame: u64) -> Option<usize> {
        let mut selected = None;
        for (i, r) in self.rules.iter().enumerate() {
            if r.start > frame {
                break;
            }
            if r.contains(frame) {
                selected = Some(i);
            }
        }
        selected
    }

    /// Reconfigure `session` if the rule in force changes at `frame`.
    /// Returns whether a reconfiguration happened.
    pub fn on_frame(&mut self, frame: u64, session: &mut dyn EncoderSession) -> Result<bool> {
        if self.rules.is_empty() {
            return Ok(false);
        }
        let selected = self.select(frame);
        if selected == self.applied {
            return Ok(false);
        }
        let rc = match selected {
            Some(i) => self.rules[i].apply(&self.base),
            None => self.base.clone(),
        };
        session.reconfigure(&rc, true, true)?;
        info!(
            frame,
            rule = ?selected,
            mode = ?rc.mode,
            avg_kbps = rc.avg_bitrate_kbps,
            "Rate control reconfigured"
        );
        self.applied = selected;
        self.current = Arc::new(rc);
        self.transitions += 1;
        Ok(true)
    }

    /// Parameters currently applied to the session.
    pub fn current(&self) -> Arc<RateControl> {
        Arc::clone(&self.current)
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncodeConfig, EncodeSettings};
    use crate::reference::ReferenceSession;
    use crate::session::PictureParams;
    use hwtc_core::types::{MemoryLocation, PictureStructure, Rational};

    fn rule(start: u64, end: Option<u64>, kbps: u32) -> DynamicRcRule {
        DynamicRcRule {
            start,
            end,
            mode: RateControlMode::Vbr,
            qp: None,
            avg_bitrate_kbps: Some(kbps),
            max_bitrate_kbps: None,
            target_quality: None,
        }
    }

    #[test]
    fn overlapping_rules_rejected() {
        let err = DynamicRcController::new(
            vec![rule(0, Some(100), 1000), rule(50, Some(150), 2000)],
            RateControl::default(),
        )
        .expect_err("overlap");
        assert_eq!(err.error_code(), 104);
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn open_ended_rule_overlaps_everything_after() {
        assert!(validate_rules(vec![rule(10, None, 1000), rule(20, Some(30), 2000)]).is_err());
        assert!(validate_rules(vec![rule(10, Some(0), 1000), rule(20, Some(30), 2000)]).is_err());
    }

    #[test]
    fn empty_range_rejected() {
        let err = validate_rules(vec![rule(30, Some(30), 1000)]).expect_err("empty");
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn rules_sorted_and_selected() {
        let c = DynamicRcController::new(
            vec![rule(100, Some(200), 2000), rule(0, Some(50), 1000)],
            RateControl::default(),
        )
        .unwrap();
        assert_eq!(c.select(0), Some(0));
        assert_eq!(c.select(49), Some(0));
        assert_eq!(c.select(50), None);
        assert_eq!(c.select(150), Some(1));
        assert_eq!(c.select(200), None);
    }

    #[test]
    fn const_qp_rule_clears_max_bitrate() {
        let base = RateControl {
            max_bitrate_kbps: 9_000,
            ..RateControl::default()
        };
        let r = DynamicRcRule {
            mode: RateControlMode::ConstQp,
            qp: Some(QpTriplet { i: 18, p: 20, b: 22 }),
            ..rule(0, None, 0)
        };
        let rc = r.apply(&base);
        assert_eq!(rc.qp.i, 18);
        assert_eq!(rc.max_bitrate_kbps, 0);
    }

    #[test]
    fn one_reconfigure_per_transition_with_idr() {
        let settings = EncodeSettings {
            b_frames: 0,
            gop_length: 1_000,
            ..EncodeSettings::default()
        };
        let fps = Rational::new(30, 1).unwrap();
        let cfg = EncodeConfig::resolve(&settings, 640, 480, fps, Rational::new(1, 1).unwrap(), PictureStructure::Progressive).unwrap();
        let mut s = ReferenceSession::new();
        s.initialize(&cfg).unwrap();
        s.create_slot(0, MemoryLocation::Device).unwrap();
        let stats = s.stats();

        let mut c = DynamicRcController::new(
            vec![rule(10, Some(20), 1_000), rule(20, Some(30), 2_000)],
            cfg.rc.clone(),
        )
        .unwrap();
        for i in 0..40u64 {
            c.on_frame(i, &mut s).unwrap();
            s.map_input(0).unwrap();
            s.submit(
                0,
                &PictureParams {
                    timestamp: i as i64,
                    duration: 1,
                    frame_index: i,
                    input_frame_id: i,
                    picstruct: PictureStructure::Progressive,
                    force_idr: false,
                    sei: Vec::new(),
                },
            )
            .unwrap();
            s.lock_bitstream(0).unwrap();
            s.unlock_bitstream(0).unwrap();
            s.unmap_input(0).unwrap();
        }
        assert_eq!(c.transitions(), 3);
        let st = stats.lock().unwrap();
        let at: Vec<u64> = st.reconfigurations.iter().map(|(i, _)| *i).collect();
        assert_eq!(at, vec![10, 20, 30]);
        assert_eq!(st.idr_frames, vec![0, 10, 20, 30]);
        assert_eq!(st.reconfigurations[2].1, cfg.rc);
        assert_eq!(c.current().avg_bitrate_kbps, cfg.rc.avg_bitrate_kbps);
    }
}
