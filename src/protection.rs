//! Stream Protection Config and its publication-acceptance rule, §3.

/// How strongly a `StreamProtectionConfig` can be trusted. Ordered so that
/// `HIGH` (a decoded ECM/PAT/PMT triple) only ever loses to a fresh
/// `RESET` on channel switch, never to a stale re-publication of the same
/// or lower confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    Reset,
    Low,
    Mid,
    High,
}

#[derive(Debug, Clone, Default)]
pub struct StreamProtectionConfig {
    pub confidence: Option<Confidence>,
    pub channel: String,
    pub ecm: Vec<u8>,
    pub pat: Vec<u8>,
    pub pmt: Vec<u8>,
    pub is_clear: bool,
}

impl StreamProtectionConfig {
    pub fn reset(channel: impl Into<String>) -> Self {
        Self {
            confidence: Some(Confidence::Reset),
            channel: channel.into(),
            ..Default::default()
        }
    }

    /// A write to `drm0` is visible iff `new.confidence == RESET` or
    /// `new.confidence >= current.confidence`.
    pub fn accepts(current: Option<&StreamProtectionConfig>, new: &StreamProtectionConfig) -> bool {
        let Some(new_conf) = new.confidence else {
            return false;
        };
        if new_conf == Confidence::Reset {
            return true;
        }
        match current.and_then(|c| c.confidence) {
            Some(current_conf) => new_conf >= current_conf,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(confidence: Confidence) -> StreamProtectionConfig {
        StreamProtectionConfig {
            confidence: Some(confidence),
            ..Default::default()
        }
    }

    #[test]
    fn reset_always_wins() {
        let current = cfg(Confidence::High);
        let new = cfg(Confidence::Reset);
        assert!(StreamProtectionConfig::accepts(Some(&current), &new));
    }

    #[test]
    fn higher_or_equal_confidence_is_accepted() {
        let current = cfg(Confidence::Mid);
        assert!(StreamProtectionConfig::accepts(Some(&current), &cfg(Confidence::Mid)));
        assert!(StreamProtectionConfig::accepts(Some(&current), &cfg(Confidence::High)));
    }

    #[test]
    fn lower_confidence_is_rejected() {
        let current = cfg(Confidence::High);
        assert!(!StreamProtectionConfig::accepts(Some(&current), &cfg(Confidence::Low)));
    }

    #[test]
    fn first_write_with_no_current_value_is_accepted() {
        assert!(StreamProtectionConfig::accepts(None, &cfg(Confidence::Low)));
    }
}
