//! Per-resource convergence decisions
//!
//! A resource's remote state is summarized by an [`Observation`]; comparing
//! it against the desired configuration hash yields a [`Decision`]. The
//! decision function is total and pure, so the same inputs always produce
//! the same plan -- this is what makes dry runs trustworthy.

/// What the reconciler observed about a resource on the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Whether any instance of the resource exists remotely.
    pub exists: bool,
    /// The configuration hash recorded on the resource at creation time,
    /// read back from its tracking label. `None` when the resource exists
    /// but the label could not be read -- the caller is expected to have
    /// logged a warning already.
    pub recorded_hash: Option<String>,
}

/// Whether a fresh image was fetched for a container before the decision.
///
/// Resource kinds without an image (networks, volumes) and dry runs use
/// [`ImageState::NotPulled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    /// The registry had nothing newer than what the host already has.
    UpToDate,
    /// A newer image was downloaded; the resource must be redeployed even
    /// if its configuration hash is unchanged.
    Fresh,
    /// No pull was attempted.
    NotPulled,
}

/// Why an existing resource is considered stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The recorded hash differs from the desired configuration.
    HashChanged,
    /// The tracking label could not be read; failing safe means
    /// redeploying, not skipping.
    LabelUnreadable,
    /// A newer image was fetched for an otherwise unchanged configuration.
    ImageUpdated,
}

/// The action to take for a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The resource is absent and must be created.
    Create,
    /// The resource is present and matches the desired configuration.
    Skip,
    /// The resource is present but stale and must be replaced.
    Replace(StaleReason),
}

/// Decide what to do with a resource given its observed and desired state.
pub fn decide(observed: &Observation, desired_hash: &str, image: ImageState) -> Decision {
    if !observed.exists {
        return Decision::Create;
    }

    match observed.recorded_hash.as_deref() {
        None => Decision::Replace(StaleReason::LabelUnreadable),
        Some(recorded) if recorded != desired_hash => Decision::Replace(StaleReason::HashChanged),
        Some(_) if image == ImageState::Fresh => Decision::Replace(StaleReason::ImageUpdated),
        Some(_) => Decision::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(hash: &str) -> Observation {
        Observation {
            exists: true,
            recorded_hash: Some(hash.to_string()),
        }
    }

    #[test]
    fn absent_resource_is_created() {
        let observed = Observation {
            exists: false,
            recorded_hash: None,
        };
        assert_eq!(
            decide(&observed, "abc", ImageState::NotPulled),
            Decision::Create
        );
    }

    #[test]
    fn matching_hash_is_skipped() {
        assert_eq!(
            decide(&present("abc"), "abc", ImageState::UpToDate),
            Decision::Skip
        );
        assert_eq!(
            decide(&present("abc"), "abc", ImageState::NotPulled),
            Decision::Skip
        );
    }

    #[test]
    fn changed_hash_forces_replacement() {
        assert_eq!(
            decide(&present("abc"), "def", ImageState::UpToDate),
            Decision::Replace(StaleReason::HashChanged)
        );
    }

    #[test]
    fn fresh_image_forces_replacement_despite_matching_hash() {
        assert_eq!(
            decide(&present("abc"), "abc", ImageState::Fresh),
            Decision::Replace(StaleReason::ImageUpdated)
        );
    }

    #[test]
    fn unreadable_label_degrades_to_replacement() {
        let observed = Observation {
            exists: true,
            recorded_hash: None,
        };
        assert_eq!(
            decide(&observed, "abc", ImageState::UpToDate),
            Decision::Replace(StaleReason::LabelUnreadable)
        );
    }
}
