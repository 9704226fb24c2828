///! Some utility functions

use minidom::Element;

/// Walks an XML tree and returns every element that has the given name
pub fn find_elems<S: AsRef<str>>(root: &Element, searched_name: S) -> Vec<&Element> {
    let searched_name = searched_name.as_ref();
    let mut elems: Vec<&Element> = Vec::new();

    for el in root.children() {
        if el.name() == searched_name {
            elems.push(el);
        } else {
            let ret = find_elems(el, searched_name);
            elems.extend(ret);
        }
    }
    elems
}

/// Walks an XML tree until it finds an elements with the given name
pub fn find_elem<S: AsRef<str>>(root: &Element, searched_name: S) -> Option<&Element> {
    let searched_name = searched_name.as_ref();
    if root.name() == searched_name {
        return Some(root);
    }

    for el in root.children() {
        if el.name() == searched_name {
            return Some(el);
        } else {
            let ret = find_elem(el, searched_name);
            if ret.is_some() {
                return ret;
            }
        }
    }
    None
}

/// Returns the first direct child that has the given name (without recursing)
pub fn find_child<'a>(root: &'a Element, searched_name: &str) -> Option<&'a Element> {
    root.children().find(|el| el.name() == searched_name)
}

/// Extracts the code of a `<d:status>HTTP/1.1 404 Not Found</d:status>` element
pub fn parse_status_line(status: &str) -> Option<u16> {
    status.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
}

/// Escapes a string so that it can be embedded in an XML text node
pub fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}


#[cfg(test)]
mod test {
    use super::*;

    const MULTISTATUS: &str = r#"<d:multistatus xmlns:d="DAV:">
        <d:response>
            <d:href>/cal/a.ics</d:href>
            <d:propstat><d:prop><d:getetag>"1"</d:getetag></d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat>
        </d:response>
        <d:response>
            <d:href>/cal/b.ics</d:href>
            <d:status>HTTP/1.1 404 Not Found</d:status>
        </d:response>
    </d:multistatus>"#;

    #[test]
    fn test_find_elems() {
        let root: Element = MULTISTATUS.parse().unwrap();
        let responses = find_elems(&root, "response");
        assert_eq!(responses.len(), 2);
        assert_eq!(find_elem(responses[0], "href").unwrap().text(), "/cal/a.ics");
        assert_eq!(find_elem(responses[0], "getetag").unwrap().text(), "\"1\"");

        // the status of the first response lives in its propstat
        assert!(find_child(responses[0], "status").is_none());
        let status = find_child(responses[1], "status").unwrap().text();
        assert_eq!(parse_status_line(&status), Some(404));
    }

    #[test]
    fn test_status_line() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK"), Some(200));
        assert_eq!(parse_status_line("HTTP/1.1 507 Insufficient Storage"), Some(507));
        assert_eq!(parse_status_line("garbage"), None);
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("http://a.b/sync?x=1&y=<2>"), "http://a.b/sync?x=1&amp;y=&lt;2&gt;");
    }
}
