//! Personalised rendering of email templates

use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;
use crate::host::{Directory, Learner};
use crate::storage::{self, EmailTemplate, Program, Progress};
use crate::tracking::PathType;

/// How many upcoming courses a message links to
const LINKED_COURSES: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedEmail {
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

/// Links to the first courses of the learner's current path, one per line
pub fn course_links(
    conn: &Connection,
    directory: &dyn Directory,
    program_id: i64,
    path: PathType,
    site_url: &str,
) -> Result<String> {
    let base = site_url.trim_end_matches('/');
    let mut links = String::new();

    for mapping in storage::list_course_mappings(conn, program_id, Some(path))?
        .into_iter()
        .take(LINKED_COURSES)
    {
        let Some(course) = directory.course(mapping.course_id)? else {
            debug!("Course {} missing from directory, no link", mapping.course_id);
            continue;
        };
        links.push_str(&format!(
            "- {}: {}/course/view.php?id={}\n",
            course.fullname, base, course.id
        ));
    }
    Ok(links)
}

/// Fill placeholders and append the phishing example
///
/// `{firstname}` and `{lastname}` work in subject and body; `{points}`,
/// `{goal}` and `{courselinks}` in the body only.
pub fn render_email(
    template: &EmailTemplate,
    learner: &Learner,
    program: &Program,
    progress: &Progress,
    links: &str,
) -> RenderedEmail {
    let subject = template
        .subject
        .replace("{firstname}", &learner.firstname)
        .replace("{lastname}", &learner.lastname);

    let mut body = template
        .body
        .replace("{firstname}", &learner.firstname)
        .replace("{lastname}", &learner.lastname)
        .replace("{points}", &progress.total_points.to_string())
        .replace("{goal}", &program.mastery_goal.to_string())
        .replace("{courselinks}", links);

    if !template.phishing_example.is_empty() {
        body.push_str("\n\n---\nPHISHING EXAMPLE:\n");
        body.push_str(&template.phishing_example);
    }

    RenderedEmail {
        subject,
        html_body: body.replace('\n', "<br />\n"),
        text_body: body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fakes::MemoryHost;
    use crate::storage::{NewCourseMapping, NewEmailTemplate, NewProgram, open_in_memory};
    use chrono::Utc;

    fn fixture() -> (Connection, MemoryHost, Program, Progress, EmailTemplate) {
        let conn = open_in_memory().unwrap();
        let now = Utc::now();
        let mut new = NewProgram::new("P", now);
        new.mastery_goal = 30;
        let program_id = storage::insert_program(&conn, &new, now).unwrap();

        let mut host = MemoryHost::default();
        for (seq, course) in [(1, 101), (2, 102), (3, 103), (4, 104)] {
            let mut mapping = NewCourseMapping::new(course, 2, PathType::Standard);
            mapping.sequence_order = seq;
            storage::insert_course_mapping(&conn, program_id, &mapping, now).unwrap();
            host.add_course(course, &format!("Course {}", course));
        }
        host.add_user(7, "Alan", "Turing");

        storage::insert_progress(&conn, program_id, 7, now).unwrap();
        let progress = storage::find_progress(&conn, program_id, 7).unwrap().unwrap();
        let email_id = storage::insert_template(
            &conn,
            program_id,
            &NewEmailTemplate {
                day_offset: 1,
                subject: "Hi {firstname} {lastname}".to_string(),
                body: "{firstname}, you have {points}/{goal}.\n{courselinks}".to_string(),
                phishing_example: "From: it-support@examp1e.com".to_string(),
                course_id: None,
                topic_id: None,
            },
            now,
        )
        .unwrap();
        let template = storage::get_template(&conn, email_id).unwrap();
        let program = storage::get_program(&conn, program_id).unwrap();
        (conn, host, program, progress, template)
    }

    #[test]
    fn test_course_links_take_next_three() {
        let (conn, host, program, _, _) = fixture();
        let links = course_links(&conn, &host, program.id, PathType::Standard, "https://lms.example.com/").unwrap();
        assert_eq!(
            links,
            "- Course 101: https://lms.example.com/course/view.php?id=101\n\
             - Course 102: https://lms.example.com/course/view.php?id=102\n\
             - Course 103: https://lms.example.com/course/view.php?id=103\n"
        );
        assert!(course_links(&conn, &host, program.id, PathType::Remedial, "x").unwrap().is_empty());
    }

    #[test]
    fn test_render_fills_placeholders() {
        let (conn, host, program, progress, template) = fixture();
        let learner = host.users[&7].clone();
        let links = course_links(&conn, &host, program.id, progress.current_path, "https://lms").unwrap();

        let email = render_email(&template, &learner, &program, &progress, &links);
        assert_eq!(email.subject, "Hi Alan Turing");
        assert!(email.text_body.starts_with("Alan, you have 0/30.\n- Course 101"));
        assert!(email.text_body.ends_with("---\nPHISHING EXAMPLE:\nFrom: it-support@examp1e.com"));
        assert!(email.html_body.starts_with("Alan, you have 0/30.<br />\n- Course 101"));
        assert!(!email.text_body.contains('{'));
    }

    #[test]
    fn test_points_placeholder_not_in_subject() {
        let (_, host, program, progress, mut template) = fixture();
        template.subject = "{points} points".to_string();
        template.phishing_example.clear();
        let email = render_email(&template, &host.users[&7], &program, &progress, "");
        assert_eq!(email.subject, "{points} points");
        assert!(!email.text_body.contains("PHISHING EXAMPLE"));
    }
}
