//! Itinerary record.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One trip itinerary. `id` is generated at first creation and preserved
/// across edits; `owner` never changes once the first version is committed.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct Itinerary {
    #[serde(default)]
    pub id: String,

    pub name: String,

    pub location: String,

    pub start_date: String,

    pub end_date: String,

    #[serde(default)]
    pub description: String,

    /// Email of the creator.
    #[serde(default)]
    pub owner: String,

    /// Emails of the users this itinerary is shared with.
    #[serde(default)]
    pub sharees: Vec<String>,

    /// 1 on creation, +1 per committed edit. In an edit payload, the
    /// version the editor based its changes on.
    #[serde(default)]
    pub version: u32,

    /// Set on edit payloads: id of the record being superseded.
    #[serde(default)]
    pub prev_id: Option<String>,
}

impl Itinerary {
    /// Is this payload an edit of an existing record?
    #[inline]
    pub fn is_edit(&self) -> bool {
        self.prev_id.is_some() && self.version >= 1
    }
}

impl fmt::Display for Itinerary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Itinerary Details:")?;
        writeln!(f)?;
        writeln!(f, "Name: {}", self.name)?;
        writeln!(f, "Location: {}", self.location)?;
        writeln!(f, "Description: {}", self.description)?;
        writeln!(f, "Start Date: {}", self.start_date)?;
        writeln!(f, "End Date: {}", self.end_date)?;
        writeln!(f, "Created by: {}", self.owner)?;
        writeln!(
            f,
            "List of Users with whom this Itinerary is shared with: [{}]",
            self.sharees.join(", ")
        )?;
        write!(f, "Version: {}", self.version)
    }
}

#[cfg(test)]
mod itinerary_tests {
    use super::*;

    #[test]
    fn display_format() {
        let itinerary = Itinerary {
            id: "t1".into(),
            name: "Paris Trip".into(),
            location: "Paris".into(),
            start_date: "2024-05-01".into(),
            end_date: "2024-05-07".into(),
            description: "museums".into(),
            owner: "ann@x.com".into(),
            sharees: vec!["bob@x.com".into(), "cat@x.com".into()],
            version: 2,
            prev_id: None,
        };
        let text = itinerary.to_string();
        assert!(text.starts_with("Itinerary Details:\n\nName: Paris Trip\n"));
        assert!(text.contains("Created by: ann@x.com\n"));
        assert!(text.contains("shared with: [bob@x.com, cat@x.com]\n"));
        assert!(text.ends_with("Version: 2"));
    }

    #[test]
    fn edit_detection() -> Result<(), serde_json::Error> {
        let fresh: Itinerary = serde_json::from_str(
            r#"{"name":"A","location":"B","start_date":"x","end_date":"y"}"#,
        )?;
        assert!(!fresh.is_edit());
        assert_eq!(fresh.version, 0);
        let edit = Itinerary {
            prev_id: Some("t1".into()),
            version: 1,
            ..fresh
        };
        assert!(edit.is_edit());
        Ok(())
    }
}
