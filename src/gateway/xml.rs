//! Synthesized S3 XML responses.

/// Escape text for inclusion in XML content or attribute values.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// A well-formed, empty `ListBucketResult`, returned when the caller's
/// bucket does not exist yet, so clients see "no objects" rather than an
/// error.
pub fn empty_list_result(bucket: &str, prefix: Option<&str>) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
            "<ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">",
            "<Name>{}</Name>",
            "<Prefix>{}</Prefix>",
            "<KeyCount>0</KeyCount>",
            "<MaxKeys>1000</MaxKeys>",
            "<IsTruncated>false</IsTruncated>",
            "</ListBucketResult>"
        ),
        escape(bucket),
        escape(prefix.unwrap_or("")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_all_entities() {
        assert_eq!(
            escape(r#"a&b<c>d"e'f"#),
            "a&amp;b&lt;c&gt;d&quot;e&apos;f"
        );
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn test_empty_list_result_is_escaped() {
        let xml = empty_list_result("user-123", Some("dir<1>/"));
        assert!(xml.contains("<Name>user-123</Name>"));
        assert!(xml.contains("<Prefix>dir&lt;1&gt;/</Prefix>"));
        assert!(xml.contains("<KeyCount>0</KeyCount>"));
        assert!(xml.contains("<IsTruncated>false</IsTruncated>"));
    }
}
