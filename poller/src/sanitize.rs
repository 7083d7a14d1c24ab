/*
 * Copyright 2025 Carver Automation Corporation.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Small text-hygiene helpers used when enriching check responses (spec §4.4).

const MAX_ENRICHED_FIELD_LEN: usize = 512;

/// Strips control bytes and caps length at 512 for fields folded into a
/// check response (host_ip/host_name enrichment).
pub fn sanitize_field(input: &str) -> String {
    let cleaned: String = input.chars().filter(|c| !c.is_control()).collect();
    if cleaned.chars().count() > MAX_ENRICHED_FIELD_LEN {
        cleaned.chars().take(MAX_ENRICHED_FIELD_LEN).collect()
    } else {
        cleaned
    }
}

/// Extracts every well-formed MAC address from `input`, uppercased, with
/// duplicates collapsed while preserving first-seen order (spec §8).
pub fn extract_macs(input: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut macs = Vec::new();
    let bytes: Vec<char> = input.chars().collect();
    let n = bytes.len();
    let mut i = 0;
    while i < n {
        if let Some((mac, consumed)) = try_parse_mac(&bytes[i..]) {
            let upper = mac.to_uppercase();
            if seen.insert(upper.clone()) {
                macs.push(upper);
            }
            i += consumed;
        } else {
            i += 1;
        }
    }
    macs
}

/// Attempts to parse a MAC address (`aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`)
/// starting at the front of `chars`. Returns the matched text and how many
/// characters it consumed.
fn try_parse_mac(chars: &[char]) -> Option<(String, usize)> {
    const GROUPS: usize = 6;
    let mut consumed = 0;
    let mut groups = Vec::with_capacity(GROUPS);
    let mut sep = None;

    for g in 0..GROUPS {
        if consumed + 2 > chars.len() {
            return None;
        }
        let pair = &chars[consumed..consumed + 2];
        if !pair.iter().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        groups.push(pair.iter().collect::<String>());
        consumed += 2;

        if g < GROUPS - 1 {
            let next = chars.get(consumed)?;
            match sep {
                None if *next == ':' || *next == '-' => sep = Some(*next),
                Some(expected) if *next == expected => {}
                _ => return None,
            }
            consumed += 1;
        }
    }

    // Reject if a hex digit immediately follows (would mean e.g. a longer token).
    if let Some(next) = chars.get(consumed) {
        if next.is_ascii_hexdigit() {
            return None;
        }
    }

    let sep = sep.unwrap_or(':');
    Some((groups.join(&sep.to_string()), consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_control_bytes() {
        let input = "host\u{0007}name\n";
        assert_eq!(sanitize_field(input), "hostname");
    }

    #[test]
    fn sanitize_caps_length() {
        let input = "a".repeat(600);
        assert_eq!(sanitize_field(&input).chars().count(), 512);
    }

    #[test]
    fn extract_macs_finds_colon_and_dash_forms() {
        let input = "devices: aa:bb:cc:dd:ee:ff and 11-22-33-44-55-66";
        let macs = extract_macs(input);
        assert_eq!(macs, vec!["AA:BB:CC:DD:EE:FF", "11-22-33-44-55-66"]);
    }

    #[test]
    fn extract_macs_collapses_duplicates() {
        let input = "aa:bb:cc:dd:ee:ff seen twice: AA:BB:CC:DD:EE:FF";
        let macs = extract_macs(input);
        assert_eq!(macs, vec!["AA:BB:CC:DD:EE:FF"]);
    }

    #[test]
    fn extract_macs_ignores_non_mac_hex_runs() {
        let input = "checksum deadbeefcafebabe0011 is not a mac";
        assert!(extract_macs(input).is_empty());
    }
}