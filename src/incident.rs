//! Auto-incident manager
//!
//! Opens and closes incident records tied to target availability. Incidents
//! are keyed by `(source = "monitoring", source_id = target id)`; opening is
//! idempotent, closing is a no-op when nothing is open.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Datelike, Utc};
use regex::{Captures, Regex};
use tracing::{info, instrument};

use crate::model::{Incident, MONITORING_SOURCE, NewIncident, Target};
use crate::storage::{IncidentStore, StorageResult};

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(seq|year)(?::(\d{1,2}))?\}").expect("placeholder pattern is valid")
});

/// Render a registration number from a template
///
/// Supported placeholders: `{seq}`, `{seq:N}` (zero padded to N digits) and
/// `{year}` (UTC year of `at`). Anything else is copied verbatim.
pub fn render_registration_number(template: &str, seq: i64, at: DateTime<Utc>) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures| match &caps[1] {
            "seq" => match caps.get(2).and_then(|w| w.as_str().parse::<usize>().ok()) {
                Some(width) => format!("{seq:0width$}"),
                None => seq.to_string(),
            },
            _ => at.year().to_string(),
        })
        .into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncidentAction {
    Opened(Incident),
    AlreadyOpen(i64),
    Closed(i64),
    NoneOpen,
}

#[derive(Clone)]
pub struct AutoIncidentManager {
    store: Arc<dyn IncidentStore>,
    registration_template: String,
}

impl AutoIncidentManager {
    pub fn new(store: Arc<dyn IncidentStore>, registration_template: impl Into<String>) -> Self {
        Self {
            store,
            registration_template: registration_template.into(),
        }
    }

    /// Make sure an open incident exists for a target that is down
    #[instrument(skip(self, target, detail), fields(target_id = target.id))]
    pub async fn on_down(
        &self,
        target: &Target,
        detail: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<IncidentAction> {
        let source_id = target.id.to_string();

        if let Some(open) = self
            .store
            .find_open_incident_by_source(MONITORING_SOURCE, &source_id)
            .await?
        {
            return Ok(IncidentAction::AlreadyOpen(open.id));
        }

        let incident = NewIncident {
            title: format!("[monitoring] {} is down", target.name),
            description: format!(
                "Monitoring target '{}' ({}) failed its check at {}: {}",
                target.name,
                target.endpoint(),
                now.to_rfc3339(),
                detail
            ),
            severity: target.incident_severity.unwrap_or_default(),
            source: MONITORING_SOURCE.to_string(),
            source_id,
            opened_at: now,
        };

        let created = self
            .store
            .create_incident(&incident, &self.registration_template)
            .await?;
        info!("opened incident {}", created.registration_number);

        Ok(IncidentAction::Opened(created))
    }

    /// Close the open incident of a target that recovered, if any
    #[instrument(skip(self, target), fields(target_id = target.id))]
    pub async fn on_up(
        &self,
        target: &Target,
        now: DateTime<Utc>,
    ) -> StorageResult<IncidentAction> {
        let open = self
            .store
            .find_open_incident_by_source(MONITORING_SOURCE, &target.id.to_string())
            .await?;

        match open {
            Some(incident) => {
                if self.store.close_incident(incident.id, now).await? {
                    info!("closed incident {}", incident.registration_number);
                    Ok(IncidentAction::Closed(incident.id))
                } else {
                    Ok(IncidentAction::NoneOpen)
                }
            }
            None => Ok(IncidentAction::NoneOpen),
        }
    }
}
