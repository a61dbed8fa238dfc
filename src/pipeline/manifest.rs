//! Extraction manifests: the per-stage record of how many artifacts a run wrote.
//!
//! A stage writes its artifacts first and its manifest last. A manifest whose declared item
//! count disagrees with the stored artifacts therefore marks an interrupted or tampered run.

use super::stage::Stage;
use crate::store::{Artifact, ArtifactKind, DocumentId, NewArtifact};
use serde_json::json;
use std::collections::HashMap;
use time::OffsetDateTime;

/// Decoded manifest artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Stage that wrote the manifest.
    pub stage: Stage,
    /// Number of artifacts the stage declared.
    pub items: u64,
    /// Manifest creation time, used as the stage's evidence timestamp.
    pub created_at: OffsetDateTime,
}

/// Build the manifest artifact for a finished stage run.
pub fn manifest_artifact(
    document_id: DocumentId,
    stage: Stage,
    items: u64,
    method: &str,
) -> NewArtifact {
    NewArtifact::new(document_id, ArtifactKind::Manifest, method).payload(json!({
        "stage": stage.name(),
        "items": items,
        "method": method,
    }))
}

/// Newest manifest per stage; malformed manifests are ignored.
pub fn latest_manifests(artifacts: &[Artifact]) -> HashMap<Stage, Manifest> {
    let mut latest: HashMap<Stage, Manifest> = HashMap::new();
    for artifact in artifacts
        .iter()
        .filter(|artifact| artifact.kind == ArtifactKind::Manifest)
    {
        let Some(stage) = artifact
            .payload_str("stage")
            .and_then(|name| name.parse::<Stage>().ok())
        else {
            continue;
        };
        let Some(items) = artifact.payload.get("items").and_then(|value| value.as_u64()) else {
            continue;
        };
        let candidate = Manifest {
            stage,
            items,
            created_at: artifact.created_at,
        };
        match latest.get(&stage) {
            Some(existing) if existing.created_at >= candidate.created_at => {}
            _ => {
                latest.insert(stage, candidate);
            }
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;
    use uuid::Uuid;

    fn stored(new: NewArtifact, created_at: OffsetDateTime) -> Artifact {
        Artifact::from_new(Uuid::new_v4(), new, created_at)
    }

    #[test]
    fn keeps_the_newest_manifest_per_stage() {
        let document = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let artifacts = vec![
            stored(manifest_artifact(document, Stage::TableExtraction, 3, "local"), now),
            stored(
                manifest_artifact(document, Stage::TableExtraction, 5, "local"),
                now + Duration::seconds(1),
            ),
            stored(manifest_artifact(document, Stage::LinkExtraction, 0, "local"), now),
            stored(
                NewArtifact::new(document, ArtifactKind::Manifest, "local")
                    .payload(json!({"stage": "bogus", "items": 1})),
                now,
            ),
        ];

        let latest = latest_manifests(&artifacts);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&Stage::TableExtraction].items, 5);
        assert_eq!(latest[&Stage::LinkExtraction].items, 0);
    }
}
