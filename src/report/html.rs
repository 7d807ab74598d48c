//! Self-contained HTML report.
//!
//! The document carries its own stylesheet and no scripts, so it can be
//! opened from disk or mailed as-is.
//!
//! # Layout
//!
//! ```text
//! <h1>title</h1>
//! [partial-run banner]
//! summary table    run id, start/end, duration, counts, pass rate
//! cases table      one row per case
//! details          one block per outcome that did not pass
//! ```

use std::path::Path;

use anyhow::Result;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

use super::model::{CaseReport, Report};
use crate::case::{Outcome, Status};

const STYLE: &str = "
body { font-family: sans-serif; margin: 2em; color: #222; }
table { border-collapse: collapse; margin-bottom: 1.5em; }
th, td { border: 1px solid #ccc; padding: 4px 10px; text-align: left; }
th { background: #f0f0f0; }
.passed { color: #2e7d32; }
.failed { color: #c62828; }
.errored { color: #ad1457; font-weight: bold; }
.skipped { color: #f9a825; }
.banner { background: #fff3cd; border: 1px solid #f9a825; padding: 8px; margin-bottom: 1em; }
pre { background: #f7f7f7; border: 1px solid #ddd; padding: 8px; overflow-x: auto; }
";

/// Renders the report as an HTML document.
///
/// # Example
///
/// ```
/// use tlib::report::{render, render_html, RunMetadata};
///
/// let report = render(Vec::new(), RunMetadata::new("Nightly <stress>", ""));
/// let html = render_html(&report)?;
/// assert!(html.starts_with("<!DOCTYPE html>"));
/// assert!(html.contains("Nightly &lt;stress&gt;"));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn render_html(report: &Report) -> Result<String> {
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);
    let meta = &report.metadata;

    w.write_event(Event::DocType(BytesText::from_escaped("html")))?;
    open(&mut w, "html", &[("lang", "en")])?;

    open(&mut w, "head", &[])?;
    empty(&mut w, "meta", &[("charset", "utf-8")])?;
    text_element(&mut w, "title", &[], &meta.title)?;
    open(&mut w, "style", &[])?;
    w.write_event(Event::Text(BytesText::from_escaped(STYLE)))?;
    close(&mut w, "style")?;
    close(&mut w, "head")?;

    open(&mut w, "body", &[])?;
    text_element(&mut w, "h1", &[], &meta.title)?;
    if !meta.description.is_empty() {
        text_element(&mut w, "p", &[], &meta.description)?;
    }
    if report.is_partial() {
        text_element(
            &mut w,
            "div",
            &[("class", "banner")],
            &format!(
                "Partial run: stopped after {} of {} scheduled invocations.",
                report.counts.total, meta.planned
            ),
        )?;
    }

    write_summary(&mut w, report)?;
    write_cases(&mut w, &report.cases)?;
    write_details(&mut w, report)?;

    close(&mut w, "body")?;
    close(&mut w, "html")?;

    Ok(String::from_utf8(w.into_inner())?)
}

/// Renders the report and writes it to `path`.
pub fn write_html(report: &Report, path: &Path) -> Result<()> {
    let html = render_html(report)?;
    super::write_artifact(path, html.as_bytes())
}

fn write_summary(w: &mut Writer<Vec<u8>>, report: &Report) -> Result<()> {
    let meta = &report.metadata;
    let counts = &report.counts;
    let rows = [
        ("Run", meta.run_id.clone()),
        ("Started", meta.started_at.to_rfc3339()),
        ("Finished", meta.finished_at.to_rfc3339()),
        ("Duration", format!("{:.3}s", report.duration.as_secs_f64())),
        ("Planned", meta.planned.to_string()),
        ("Total", counts.total.to_string()),
        ("Passed", counts.passed.to_string()),
        ("Failed", counts.failed.to_string()),
        ("Errored", counts.errored.to_string()),
        ("Skipped", counts.skipped.to_string()),
        ("Pass rate", report.pass_rate.to_string()),
    ];

    text_element(w, "h2", &[], "Summary")?;
    open(w, "table", &[("class", "summary")])?;
    for (label, value) in rows {
        open(w, "tr", &[])?;
        text_element(w, "th", &[], label)?;
        text_element(w, "td", &[], &value)?;
        close(w, "tr")?;
    }
    close(w, "table")?;
    Ok(())
}

fn write_cases(w: &mut Writer<Vec<u8>>, cases: &[CaseReport]) -> Result<()> {
    text_element(w, "h2", &[], "Cases")?;
    open(w, "table", &[("class", "cases")])?;
    open(w, "tr", &[])?;
    for heading in ["Case", "Runs", "Passed", "Failed", "Errored", "Skipped", "Pass rate", "Time"] {
        text_element(w, "th", &[], heading)?;
    }
    close(w, "tr")?;

    for case in cases {
        let counts = &case.counts;
        let class = if counts.errored > 0 {
            "errored"
        } else if counts.failed > 0 {
            "failed"
        } else if counts.passed == 0 && counts.skipped > 0 {
            "skipped"
        } else {
            "passed"
        };
        open(w, "tr", &[("class", class)])?;
        text_element(w, "td", &[], &case.case_id)?;
        text_element(w, "td", &[], &counts.total.to_string())?;
        text_element(w, "td", &[], &counts.passed.to_string())?;
        text_element(w, "td", &[], &counts.failed.to_string())?;
        text_element(w, "td", &[], &counts.errored.to_string())?;
        text_element(w, "td", &[], &counts.skipped.to_string())?;
        text_element(w, "td", &[], &case.pass_rate.to_string())?;
        text_element(w, "td", &[], &format!("{:.3}s", case.busy.as_secs_f64()))?;
        close(w, "tr")?;
    }
    close(w, "table")?;
    Ok(())
}

fn write_details(w: &mut Writer<Vec<u8>>, report: &Report) -> Result<()> {
    let mut details = report.non_passed().peekable();
    if details.peek().is_none() {
        return Ok(());
    }

    text_element(w, "h2", &[], "Details")?;
    for outcome in details {
        write_outcome(w, outcome)?;
    }
    Ok(())
}

fn write_outcome(w: &mut Writer<Vec<u8>>, outcome: &Outcome) -> Result<()> {
    let class = outcome.status.to_string();
    open(w, "div", &[("class", "outcome")])?;
    text_element(
        w,
        "h3",
        &[("class", class.as_str())],
        &format!(
            "{} {} (iteration {}, loop {}, {:.3}s)",
            outcome.status.label(),
            outcome.case_id,
            outcome.iteration,
            outcome.loop_index,
            outcome.duration.as_secs_f64()
        ),
    )?;
    if !outcome.message.is_empty() {
        text_element(w, "p", &[], &outcome.message)?;
    }
    if let Some(traceback) = &outcome.traceback {
        text_element(w, "pre", &[("class", "traceback")], traceback)?;
    }
    if outcome.status != Status::Skipped && !outcome.captured_output.is_empty() {
        text_element(w, "pre", &[("class", "output")], &outcome.captured_output)?;
    }
    close(w, "div")?;
    Ok(())
}

fn open(w: &mut Writer<Vec<u8>>, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
    let mut start = BytesStart::new(name);
    for attr in attrs {
        start.push_attribute(*attr);
    }
    w.write_event(Event::Start(start))?;
    Ok(())
}

fn empty(w: &mut Writer<Vec<u8>>, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
    let mut start = BytesStart::new(name);
    for attr in attrs {
        start.push_attribute(*attr);
    }
    w.write_event(Event::Empty(start))?;
    Ok(())
}

fn close(w: &mut Writer<Vec<u8>>, name: &str) -> Result<()> {
    w.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn text_element(
    w: &mut Writer<Vec<u8>>,
    name: &str,
    attrs: &[(&str, &str)],
    text: &str,
) -> Result<()> {
    open(w, name, attrs)?;
    w.write_event(Event::Text(BytesText::new(text)))?;
    close(w, name)
}
