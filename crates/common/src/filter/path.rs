use std::collections::HashSet;

/// Translate a path template into an anchored, case-insensitive regex
///
/// Supported forms: `:name` (one segment), `:name?` (optional segment),
/// `:name*` (zero or more segments), `:name+` (one or more segments) and a bare `*`
/// (anything). A `${NAME}` segment matches one path segment and is captured in a group
/// named `NAME`, so the matched text can later be swapped for the configured value.
/// A trailing slash on the request path is tolerated.
pub fn template_to_regex(template: &str) -> String {
    const SEGMENT: &str = "[^/]+?";
    let repeated = format!("(?:{SEGMENT})(?:/(?:{SEGMENT}))*");

    let template = if template.starts_with('/') {
        template.to_string()
    } else {
        format!("/{}", template)
    };
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::from("(?i)^");
    let mut named = HashSet::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '$'
            && chars.get(i + 1) == Some(&'{')
            && let Some(len) = chars[i + 2..].iter().position(|c| *c == '}')
        {
            let name: String = chars[i + 2..i + 2 + len].iter().collect();
            // regex group names must be unique
            if is_group_name(&name) && named.insert(name.clone()) {
                out.push_str(&format!("(?P<{name}>{SEGMENT})"));
            } else {
                out.push_str(&format!("({SEGMENT})"));
            }
            i += len + 3;
            continue;
        }

        let prefixed = c == '/' && chars.get(i + 1) == Some(&':') && is_ident(chars.get(i + 2));
        let bare = c == ':' && is_ident(chars.get(i + 1));

        if prefixed || bare {
            let start = if prefixed { i + 2 } else { i + 1 };
            let mut j = start;
            while is_ident(chars.get(j)) {
                j += 1;
            }
            let modifier = chars.get(j).copied().filter(|m| matches!(m, '?' | '*' | '+'));
            let group = match (prefixed, modifier) {
                (true, None) => format!("/({SEGMENT})"),
                (true, Some('?')) => format!("(?:/({SEGMENT}))?"),
                (true, Some('*')) => format!("(?:/({repeated}))?"),
                (true, Some(_)) => format!("/({repeated})"),
                (false, None) => format!("({SEGMENT})"),
                (false, Some('?')) => format!("({SEGMENT})?"),
                (false, Some('*')) => format!("({repeated})?"),
                (false, Some(_)) => format!("({repeated})"),
            };
            out.push_str(&group);
            i = j + usize::from(modifier.is_some());
        } else if c == '*' {
            out.push_str("(.*)");
            i += 1;
        } else {
            out.push_str(&regex::escape(&c.to_string()));
            i += 1;
        }
    }

    if out.ends_with('/') && template.len() > 1 {
        out.pop();
    }
    out.push_str("(?:/)?$");
    out
}

/// Names of the `${NAME}` segments in a path template
pub fn config_segments(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        let name = &rest[start + 2..start + 2 + len];
        if is_group_name(name) && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        rest = &rest[start + 3 + len..];
    }
    names
}

fn is_group_name(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_ident(c: Option<&char>) -> bool {
    c.is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_')
}
