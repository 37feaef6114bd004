/// Ordered header list. Names keep the casing they arrived with; every
/// lookup compares case-insensitively without allocating.
pub type Headers = Vec<(String, String)>;

fn names_match(candidate: &str, wanted: &str) -> bool {
    candidate.eq_ignore_ascii_case(wanted)
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find_map(|(candidate, value)| names_match(candidate, name).then_some(value.as_str()))
}

/// Overwrite an existing header in place, or append when absent. The first
/// matching entry wins; list order is otherwise preserved.
pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    match headers
        .iter_mut()
        .find(|(candidate, _)| names_match(candidate, &name))
    {
        Some(slot) => slot.1 = value,
        None => headers.push((name, value)),
    }
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let position = headers
        .iter()
        .position(|(candidate, _)| names_match(candidate, name))?;
    Some(headers.remove(position).1)
}
