use anyhow::Context;
use tracing::info;
use unicode_normalization::UnicodeNormalization;

use crate::db::query::{self, EventRow};
use crate::db::{writer, DbPool};
use crate::error::PipelineError;
use crate::models::{Caller, Event, Role};

/// URL-safe id: NFKD-decomposed with the non-ASCII remainder dropped,
/// punctuation dropped, runs of spaces and dashes collapsed to one dash,
/// lowercase.
pub fn slugify(value: &str) -> String {
    let ascii: String = value.nfkd().filter(char::is_ascii).collect();

    let mut slug = String::with_capacity(ascii.len());
    let mut pending_dash = false;
    for c in ascii.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else if c == '-' || c.is_ascii_whitespace() {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "event".to_string()
    } else {
        slug
    }
}

pub fn share_link(public_base_url: &str, owner_id: &str, event_id: &str) -> String {
    format!("{}/event/{}/{}", public_base_url.trim_end_matches('/'), slugify(owner_id), event_id)
}

pub fn to_event(row: EventRow, public_base_url: &str) -> Event {
    let share_link = share_link(public_base_url, &row.owner_id, &row.event_id);
    Event { event_id: row.event_id, name: row.name, owner_id: row.owner_id, created_at: row.created_at, share_link }
}

/// Photographers and admins create events; the slug of `name` becomes the
/// id, with `-2`, `-3`, ... appended until it is free.
pub fn create_event(pool: &DbPool, public_base_url: &str, caller: &Caller, name: &str) -> Result<Event, PipelineError> {
    if caller.role == Role::Attendee {
        return Err(PipelineError::Authorization("only photographers and admins can create events".into()));
    }
    let name = name.trim();
    if name.is_empty() {
        return Err(PipelineError::Validation("event name is empty".into()));
    }

    let conn = pool.get()?;
    let base = slugify(name);
    let mut event_id = base.clone();
    let mut n = 2;
    while query::event_exists(&conn, &event_id)? {
        event_id = format!("{base}-{n}");
        n += 1;
    }

    let event = Event {
        share_link: share_link(public_base_url, &caller.user_id, &event_id),
        event_id,
        name: name.to_string(),
        owner_id: caller.user_id.clone(),
        created_at: chrono::Utc::now().timestamp(),
    };
    writer::insert_event(&conn, &event).with_context(|| format!("failed to store event {}", event.event_id))?;
    info!(event_id = %event.event_id, owner_id = %event.owner_id, "event created");
    Ok(event)
}

/// Admins see every event, everyone else their own. Newest first.
pub fn list_events(pool: &DbPool, public_base_url: &str, caller: &Caller) -> Result<Vec<Event>, PipelineError> {
    let conn = pool.get()?;
    let owner = (!caller.is_admin()).then_some(caller.user_id.as_str());
    Ok(query::list_events(&conn, owner)?.into_iter().map(|row| to_event(row, public_base_url)).collect())
}

/// Uploads are for the event's owner and for admins.
pub fn authorize_upload(caller: &Caller, event: &EventRow) -> Result<(), PipelineError> {
    if caller.is_admin() || (caller.role == Role::Photographer && caller.user_id == event.owner_id) {
        Ok(())
    } else {
        Err(PipelineError::Authorization(format!(
            "user {} may not upload to event {}",
            caller.user_id, event.event_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;

    #[test]
    fn slugify_folds_and_collapses() {
        assert_eq!(slugify("Summer Wedding 2024"), "summer-wedding-2024");
        assert_eq!(slugify("  Café  Déjà-Vu!! "), "cafe-deja-vu");
        assert_eq!(slugify("a -- b"), "a-b");
        assert_eq!(slugify("snake_case ok"), "snake_case-ok");
        assert_eq!(slugify("???"), "event");
        assert_eq!(slugify("-lead"), "lead");
    }

    #[test]
    fn slugify_decomposes_beyond_latin1() {
        assert_eq!(slugify("Čapek Ślub"), "capek-slub");
        assert_eq!(slugify("Ångström Œuvre"), "angstrom-uvre");
        assert_eq!(slugify("\u{FB01}esta"), "fiesta");
        assert_eq!(slugify("Straße"), "strae");
        assert_eq!(slugify("東京"), "event");
    }

    #[test]
    fn share_link_uses_owner_slug() {
        assert_eq!(share_link("http://h/", "Jane Doe", "gala"), "http://h/event/jane-doe/gala");
    }

    #[test]
    fn create_event_makes_unique_ids() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(dir.path().join("nazr.db"), 2).unwrap();
        let p = Caller::new("p1", Role::Photographer);
        let a = create_event(&pool, "http://h", &p, "Gala Night").unwrap();
        let b = create_event(&pool, "http://h", &p, "gala night").unwrap();
        let c = create_event(&pool, "http://h", &p, "Gala-Night").unwrap();
        assert_eq!((a.event_id.as_str(), b.event_id.as_str(), c.event_id.as_str()), ("gala-night", "gala-night-2", "gala-night-3"));
        assert_eq!(a.share_link, "http://h/event/p1/gala-night");

        let attendee = Caller::new("a1", Role::Attendee);
        assert!(matches!(create_event(&pool, "http://h", &attendee, "x"), Err(PipelineError::Authorization(_))));
        assert!(matches!(create_event(&pool, "http://h", &p, "   "), Err(PipelineError::Validation(_))));

        let other = Caller::new("p2", Role::Photographer);
        create_event(&pool, "http://h", &other, "Other").unwrap();
        assert_eq!(list_events(&pool, "http://h", &p).unwrap().len(), 3);
        assert_eq!(list_events(&pool, "http://h", &Caller::new("root", Role::Admin)).unwrap().len(), 4);
    }

    #[test]
    fn uploads_need_owner_or_admin() {
        let row = EventRow { event_id: "e".into(), name: "E".into(), owner_id: "p1".into(), created_at: 0 };
        assert!(authorize_upload(&Caller::new("p1", Role::Photographer), &row).is_ok());
        assert!(authorize_upload(&Caller::new("root", Role::Admin), &row).is_ok());
        assert!(authorize_upload(&Caller::new("p2", Role::Photographer), &row).is_err());
        assert!(authorize_upload(&Caller::new("p1", Role::Attendee), &row).is_err());
    }
}
