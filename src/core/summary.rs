//! On-disk form of a report: `summary.xml`, optionally packed in a
//! bzip2-compressed tarball.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use bzip2::read::BzDecoder;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::Serialize;

use crate::core::error::{Result, RtevalError};
use crate::core::report::{Report, ReportNode, REPORT_ROOT};

pub const SUMMARY_FILE: &str = "summary.xml";

fn xml_error(e: impl std::fmt::Display) -> RtevalError {
    RtevalError::Summary(format!("XML error: {}", e))
}

/// Render a report tree as an indented XML document.
pub fn to_xml_string(root: &ReportNode) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    write_node(&mut writer, root)?;
    let mut text = String::from_utf8(writer.into_inner()).map_err(xml_error)?;
    text.push('\n');
    Ok(text)
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &ReportNode) -> Result<()> {
    let mut start = BytesStart::new(node.name.as_str());
    for (key, value) in &node.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    if node.text.is_none() && node.children.is_empty() {
        return writer.write_event(Event::Empty(start)).map_err(xml_error);
    }

    writer.write_event(Event::Start(start)).map_err(xml_error)?;
    if let Some(text) = &node.text {
        writer.write_event(Event::Text(BytesText::new(text))).map_err(xml_error)?;
    }
    for child in &node.children {
        write_node(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(node.name.as_str())))
        .map_err(xml_error)
}

fn element(start: &BytesStart<'_>) -> Result<ReportNode> {
    let name = std::str::from_utf8(start.name().as_ref()).map_err(xml_error)?.to_string();
    let mut node = ReportNode::new(&name);
    for attr in start.attributes() {
        let attr = attr.map_err(xml_error)?;
        let key = std::str::from_utf8(attr.key.as_ref()).map_err(xml_error)?;
        let value = attr.unescape_value().map_err(xml_error)?;
        node.set_attr(key, value);
    }
    Ok(node)
}

/// Parse a document produced by [`to_xml_string`] back into a tree.
pub fn from_xml_str(text: &str) -> Result<ReportNode> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<ReportNode> = Vec::new();
    let mut root = None;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(start) => {
                if stack.is_empty() && root.is_some() {
                    return Err(xml_error("document has more than one root element"));
                }
                stack.push(element(&start)?);
            }
            Event::Empty(start) => {
                let node = element(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.push(node),
                    None if root.is_some() => {
                        return Err(xml_error("document has more than one root element"));
                    }
                    None => root = Some(node),
                }
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(xml_error)?;
                match stack.last_mut() {
                    Some(current) => current.text.get_or_insert_with(String::new).push_str(&text),
                    None if !text.trim().is_empty() => {
                        return Err(xml_error("text outside the root element"));
                    }
                    None => {}
                }
            }
            Event::CData(data) => {
                let data = String::from_utf8_lossy(&data.into_inner()).into_owned();
                if let Some(current) = stack.last_mut() {
                    current.text.get_or_insert_with(String::new).push_str(&data);
                }
            }
            Event::End(_) => {
                let node = stack.pop().ok_or_else(|| xml_error("unbalanced end tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.push(node),
                    None => root = Some(node),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if !stack.is_empty() {
        return Err(xml_error("document ended inside an element"));
    }
    root.ok_or_else(|| xml_error("document has no root element"))
}

/// Parse a summary document, rejecting anything that is not a report.
pub fn parse_report(text: &str) -> Result<Report> {
    let root = from_xml_str(text)?;
    if root.name != REPORT_ROOT {
        return Err(RtevalError::Summary(format!(
            "Not a report: document root is <{}>, expected <{}>", root.name, REPORT_ROOT
        )));
    }
    Ok(Report::from_root(root))
}

fn is_archive(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.ends_with(".tar.bz2") || name.ends_with(".tbz2") || name.ends_with(".tbz")
}

/// Read `summary.xml` out of a bzip2 tarball without unpacking it to disk.
fn read_from_archive(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut archive = tar::Archive::new(BzDecoder::new(file));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let is_summary = entry
            .path()?
            .file_name()
            .map_or(false, |name| name == SUMMARY_FILE);
        if is_summary {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            return Ok(text);
        }
    }
    Err(RtevalError::Summary(format!("{} not found in {}", SUMMARY_FILE, path.display())))
}

/// Load a finished report from a `summary.xml` file or a `.tar.bz2`
/// archive containing one.
pub fn load_report(path: &Path) -> Result<Report> {
    let text = if is_archive(path) {
        read_from_archive(path)?
    } else {
        fs::read_to_string(path)?
    };
    parse_report(&text)
}

/// Write `summary.xml` into `dir`, creating it if needed.
pub fn write_report(report: &Report, dir: &Path) -> Result<std::path::PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(SUMMARY_FILE);
    fs::write(&path, to_xml_string(report.root())?)?;
    Ok(path)
}

/// One latency histogram bucket of one CPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistogramRow {
    pub module: String,
    pub cpu: String,
    pub latency_us: u64,
    pub samples: u64,
}

/// Flatten every per-CPU histogram found in the measurement section.
pub fn raw_histogram(report: &Report) -> Vec<HistogramRow> {
    let mut rows = Vec::new();
    for module in report.modules(crate::core::config::MEASUREMENT_SECTION) {
        let name = module.attribute("name").unwrap_or_default();
        for fragment in &module.children {
            for cpu in fragment.children_named("cpu") {
                let id = cpu.attribute("id").unwrap_or("?");
                let buckets = cpu.find("histogram").into_iter().flat_map(|h| h.children_named("bucket"));
                for bucket in buckets {
                    let latency = bucket.attribute("latency_us").and_then(|v| v.parse().ok());
                    let samples = bucket.attribute("samples").and_then(|v| v.parse().ok());
                    if let (Some(latency_us), Some(samples)) = (latency, samples) {
                        rows.push(HistogramRow {
                            module: name.to_string(),
                            cpu: id.to_string(),
                            latency_us,
                            samples,
                        });
                    }
                }
            }
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    use indoc::indoc;
    use tempfile::TempDir;

    fn sample_report() -> Report {
        let histogram = ReportNode::new("histogram")
            .child(ReportNode::new("bucket").attr("latency_us", 3).attr("samples", 120))
            .child(ReportNode::new("bucket").attr("latency_us", 4).attr("samples", 7));
        let cyclic = ReportNode::new("cyclic").child(
            ReportNode::new("cpu").attr("id", 2).attr("max", 4).child(histogram),
        );
        let root = ReportNode::new(REPORT_ROOT)
            .attr("version", "0.1.0")
            .child(ReportNode::value("annotate", "fish & <chips>"))
            .child(
                ReportNode::new("measurement")
                    .child(ReportNode::new("module").attr("name", "cyclic").child(cyclic)),
            );
        Report::from_root(root)
    }

    fn tarball(dir: &Path, members: &[(&str, &str)]) -> std::path::PathBuf {
        let path = dir.join("run.tar.bz2");
        let encoder = BzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, body) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[test]
    fn test_xml_preserves_tree() {
        let report = sample_report();
        let xml = to_xml_string(report.root()).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("fish &amp; &lt;chips&gt;"));
        assert_eq!(&from_xml_str(&xml).unwrap(), report.root());
    }

    #[test]
    fn test_wrong_root_rejected() {
        let err = parse_report("<html><body/></html>").unwrap_err();
        assert!(matches!(err, RtevalError::Summary(_)));
        assert!(err.to_string().contains("<html>"));
    }

    #[test]
    fn test_malformed_document_rejected() {
        assert!(parse_report("<rteval><loads></rteval>").is_err());
        assert!(parse_report("").is_err());
    }

    #[test]
    fn test_single_root_required() {
        for text in [
            "<rteval/><rteval/>",
            "<rteval></rteval><other/>",
            "<rteval><loads/></rteval><rteval></rteval>",
            "<rteval/> trailing",
        ] {
            assert!(matches!(parse_report(text), Err(RtevalError::Summary(_))), "accepted {:?}", text);
        }
        assert!(parse_report("<rteval/>\n").is_ok());
    }

    #[test]
    fn test_parse_handwritten_summary() {
        let report = parse_report(indoc! {r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <rteval version="0.1.0">
              <run_info aborted="false" exit_code="0">
                <duration>60</duration>
              </run_info>
            </rteval>
        "#})
        .unwrap();
        assert_eq!(report.run_info().unwrap().child_text("duration"), Some("60"));
    }

    #[test]
    fn test_load_report_from_file_and_archive() {
        let dir = TempDir::new().unwrap();
        let written = write_report(&sample_report(), dir.path()).unwrap();
        assert_eq!(load_report(&written).unwrap().root(), sample_report().root());

        let xml = fs::read_to_string(&written).unwrap();
        let archive = tarball(dir.path(), &[("rteval-20240101/README", "x"), ("rteval-20240101/summary.xml", xml.as_str())]);
        assert_eq!(load_report(&archive).unwrap().root(), sample_report().root());
    }

    #[test]
    fn test_archive_without_summary_is_not_found() {
        let dir = TempDir::new().unwrap();
        let archive = tarball(dir.path(), &[("rteval/notes.txt", "nothing here")]);
        let before: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();

        let err = load_report(&archive).unwrap_err();
        assert!(err.to_string().contains("not found"));
        let after: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(before.len(), after.len());
    }

    #[test]
    fn test_raw_histogram_rows() {
        let rows = raw_histogram(&sample_report());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], HistogramRow { module: "cyclic".into(), cpu: "2".into(), latency_us: 3, samples: 120 });
        assert_eq!(rows[1].samples, 7);
    }
}
