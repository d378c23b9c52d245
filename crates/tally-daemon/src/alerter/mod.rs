//! Generated types for the `alerter` gRPC service, and conversions to and
//! from the domain models.

use tally_common::{AlertKind, models};

use crate::entries::{self, ConvertError, entry_required, from_nanos, to_nanos};

tonic::include_proto!("alerter");

impl From<&models::Alert> for Alert {
    fn from(alert: &models::Alert) -> Self {
        let kind = match &alert.kind {
            AlertKind::Afk { active_entry } => alert::Kind::Afk(AlertAfk {
                active_entry: Some(entries::Entry::from(active_entry)),
            }),
            AlertKind::FormerlyAfk {
                afk_since,
                active_entry,
            } => alert::Kind::FormerlyAfk(AlertFormerlyAfk {
                active_entry: Some(entries::Entry::from(active_entry)),
                afk_since: to_nanos(*afk_since),
            }),
        };

        Alert {
            id: alert.id,
            created: to_nanos(alert.created_at),
            updated: to_nanos(alert.updated_at),
            kind: Some(kind),
        }
    }
}

impl TryFrom<Alert> for models::Alert {
    type Error = ConvertError;

    fn try_from(alert: Alert) -> Result<Self, Self::Error> {
        let kind = match alert.kind.ok_or(ConvertError::Missing("kind"))? {
            alert::Kind::Afk(afk) => AlertKind::Afk {
                active_entry: entry_required(afk.active_entry, "active_entry")?,
            },
            alert::Kind::FormerlyAfk(formerly) => AlertKind::FormerlyAfk {
                afk_since: from_nanos(formerly.afk_since)?,
                active_entry: entry_required(formerly.active_entry, "active_entry")?,
            },
        };

        Ok(models::Alert {
            id: alert.id,
            created_at: from_nanos(alert.created)?,
            updated_at: from_nanos(alert.updated)?,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn formerly_afk_survives_the_wire() {
        let at = datetime!(2026-03-01 09:00 UTC);
        let alert = models::Alert {
            id: 2,
            created_at: at,
            updated_at: at,
            kind: AlertKind::FormerlyAfk {
                afk_since: datetime!(2026-03-01 08:45 UTC),
                active_entry: models::Entry {
                    id: 1,
                    created_at: at,
                    updated_at: at,
                    name: "reading".to_string(),
                    start: at,
                    end: None,
                },
            },
        };

        let wire = Alert::from(&alert);
        assert!(matches!(wire.kind, Some(alert::Kind::FormerlyAfk(_))));
        assert_eq!(models::Alert::try_from(wire).unwrap(), alert);
    }

    #[test]
    fn alert_without_kind_is_rejected() {
        let wire = Alert {
            id: 1,
            created: 0,
            updated: 0,
            kind: None,
        };
        assert!(matches!(
            models::Alert::try_from(wire),
            Err(ConvertError::Missing("kind"))
        ));
    }
}
