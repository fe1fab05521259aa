//! The college's built-in forms
pub mod contest_admin;
pub mod contest_participation;
pub mod self_assessment;

use crate::{error::Result, schema::SchemaRegistry};

/// Registry with every built-in form
pub fn registry() -> Result<SchemaRegistry> {
    Ok(SchemaRegistry::new()
        .register(contest_participation::schema()?)
        .register(self_assessment::schema()?)
        .register(contest_admin::schema()?))
}

/// Catalog names the built-in forms read from
pub mod catalogs {
    /// Open contests; options may carry a `start_date` attribute
    pub const CONTESTS: &str = "contests";
    pub const TEACHERS: &str = "teachers";
    pub const ACTIVITY_TYPES: &str = "activity_types";
    pub const RESPONSIBLES: &str = "responsibles";
}

/// Field names written into records
pub mod field_keys {
    pub const CONTEST_ID: &str = "contest_id";
    pub const CONTEST_NAME: &str = "contest_name";
    pub const DATE: &str = "date";
    pub const LEVEL: &str = "level";
    pub const TEACHER_NAME: &str = "teacher_name";
    pub const NOMINATION: &str = "nomination";
    pub const PARTICIPATION_FORM: &str = "participation_form";
    pub const PARTICIPANT_TYPE: &str = "participant_type";
    pub const STUDENT_NAME: &str = "student_name";
    pub const GROUP: &str = "group";
    pub const RESULT: &str = "result";
    pub const CONFIRMATION_FILES: &str = "confirmation_files";

    pub const EVENT_TYPE: &str = "event_type";
    pub const EVENT_TYPE_CODE: &str = "event_type_code";
    pub const EVENT_NAME: &str = "event_name";
    pub const DESCRIPTION: &str = "description";
    pub const SOCIAL_MEDIA_LINK: &str = "social_media_link";
    pub const CONFIRMATION_FILE: &str = "confirmation_file";

    pub const NAME: &str = "name";
    pub const START_DATE: &str = "start_date";
    pub const END_DATE: &str = "end_date";
    pub const FILES: &str = "files";
    pub const RESPONSIBLE: &str = "responsible";
    pub const RESPONSIBLE_ID: &str = "responsible_id";
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_schemas_pass_validation() {
        let registry = registry().unwrap();
        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids, vec!["contest_admin", "contest_participation", "self_assessment"]);
    }

    // FILE_CARRY_OVER only changes groups that collect files
    #[test]
    fn test_builtin_groups_collect_no_files() {
        let registry = registry().unwrap();
        for id in registry.ids() {
            let schema = registry.get(id).unwrap();
            for group in schema.groups() {
                assert!(
                    schema.group_file_fields(&group.id).is_empty(),
                    "{id}/{} has file phases",
                    group.id
                );
            }
        }
        let participation = registry.get(contest_participation::SCHEMA_ID).unwrap();
        assert_eq!(participation.groups().count(), 1);
    }
}
