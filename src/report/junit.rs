//! JUnit XML report generation.
//!
//! JUnit XML is the de facto interchange format of CI systems, so every
//! run can be published to Jenkins, GitLab CI or GitHub Actions next to
//! the HTML report.
//!
//! # Format
//!
//! Each case becomes a `<testsuite>`, and each of its invocations a
//! `<testcase>` named after its coordinates:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="Nightly" tests="3" failures="1" errors="0" skipped="0" time="1.234">
//!   <testsuite name="disk_write" tests="2" failures="1" errors="0" skipped="0" time="0.900">
//!     <testcase classname="disk_write" name="disk_write[i0.l0]" time="0.400"/>
//!     <testcase classname="disk_write" name="disk_write[i0.l1]" time="0.500">
//!       <failure message="command `dd ...` exit status: 1" type="assertion">...</failure>
//!       <system-out>...</system-out>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::Path;

use anyhow::Result;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::model::{CaseReport, Report};
use crate::case::{Outcome, Status};

/// Generates JUnit XML content from a report.
///
/// # Example
///
/// ```
/// use tlib::report::{generate_xml, render, RunMetadata};
///
/// let xml = generate_xml(&render(Vec::new(), RunMetadata::new("ci", "")))?;
/// assert!(xml.contains(r#"<testsuites name="ci" tests="0""#));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn generate_xml(report: &Report) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let counts = &report.counts;
    let mut testsuites = BytesStart::new("testsuites");
    testsuites.push_attribute(("name", sanitize(&report.metadata.title).as_str()));
    testsuites.push_attribute(("tests", counts.total.to_string().as_str()));
    testsuites.push_attribute(("failures", counts.failed.to_string().as_str()));
    testsuites.push_attribute(("errors", counts.errored.to_string().as_str()));
    testsuites.push_attribute(("skipped", counts.skipped.to_string().as_str()));
    testsuites.push_attribute((
        "time",
        format!("{:.3}", report.duration.as_secs_f64()).as_str(),
    ));
    testsuites.push_attribute((
        "timestamp",
        report.metadata.started_at.to_rfc3339().as_str(),
    ));
    writer.write_event(Event::Start(testsuites))?;

    for case in &report.cases {
        write_testsuite(&mut writer, case)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    let xml = String::from_utf8(writer.into_inner())?;
    Ok(xml)
}

/// Generates JUnit XML and writes it to `path`.
pub fn write_junit(report: &Report, path: &Path) -> Result<()> {
    let xml = generate_xml(report)?;
    super::write_artifact(path, xml.as_bytes())
}

fn write_testsuite<W: std::io::Write>(writer: &mut Writer<W>, case: &CaseReport) -> Result<()> {
    let counts = &case.counts;
    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", sanitize(&case.case_id).as_str()));
    testsuite.push_attribute(("tests", counts.total.to_string().as_str()));
    testsuite.push_attribute(("failures", counts.failed.to_string().as_str()));
    testsuite.push_attribute(("errors", counts.errored.to_string().as_str()));
    testsuite.push_attribute(("skipped", counts.skipped.to_string().as_str()));
    testsuite.push_attribute(("time", format!("{:.3}", case.busy.as_secs_f64()).as_str()));
    writer.write_event(Event::Start(testsuite))?;

    for outcome in &case.outcomes {
        write_testcase(writer, outcome)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

/// Write a single test case element.
fn write_testcase<W: std::io::Write>(writer: &mut Writer<W>, outcome: &Outcome) -> Result<()> {
    let name = format!(
        "{}[i{}.l{}]",
        outcome.case_id, outcome.iteration, outcome.loop_index
    );
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", sanitize(&outcome.case_id).as_str()));
    testcase.push_attribute(("name", sanitize(&name).as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", outcome.duration.as_secs_f64()).as_str(),
    ));

    if outcome.status == Status::Passed && outcome.captured_output.is_empty() {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    }

    writer.write_event(Event::Start(testcase))?;

    match outcome.status {
        Status::Passed => {}
        Status::Failed | Status::Errored => {
            let (tag, kind) = if outcome.status == Status::Failed {
                ("failure", "assertion")
            } else if outcome.message.starts_with("timeout") {
                ("error", "timeout")
            } else {
                ("error", "error")
            };
            let mut element = BytesStart::new(tag);
            element.push_attribute(("message", sanitize(&outcome.message).as_str()));
            element.push_attribute(("type", kind));
            match &outcome.traceback {
                Some(trace) => {
                    writer.write_event(Event::Start(element))?;
                    writer.write_event(Event::Text(BytesText::new(&sanitize(trace))))?;
                    writer.write_event(Event::End(BytesEnd::new(tag)))?;
                }
                None => writer.write_event(Event::Empty(element))?,
            }
        }
        Status::Skipped => {
            let mut skipped = BytesStart::new("skipped");
            if !outcome.message.is_empty() {
                skipped.push_attribute(("message", sanitize(&outcome.message).as_str()));
            }
            writer.write_event(Event::Empty(skipped))?;
        }
    }

    if !outcome.captured_output.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("system-out")))?;
        writer.write_event(Event::Text(BytesText::new(&sanitize(
            &outcome.captured_output,
        ))))?;
        writer.write_event(Event::End(BytesEnd::new("system-out")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Removes characters that are not allowed anywhere in an XML document.
///
/// Markup escaping is left to the writer.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}
