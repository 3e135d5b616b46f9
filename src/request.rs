//! The distributor request mini-language.
//!
//! A request is a single string of semicolon-separated `key:value` pairs,
//! e.g. `distributorId:beamline;groupId:workers;nUpdatesPerConsumer:3`.
//! Keys are matched case-insensitively, values are case-preserving.
//! Parsing is deliberately forgiving: anything that does not parse is
//! logged and replaced by its default, so a sloppy request degrades rather
//! than fails.

use nom::{
    IResult, Parser,
    bytes::complete::take_till1,
    character::complete::char,
    combinator::rest,
    sequence::separated_pair,
};
use tracing::warn;

use crate::distributor::DispatchMode;

/// A parsed distributor request.
///
/// | key | meaning | default |
/// |---|---|---|
/// | `distributorId` | selects/creates the distributor | `default` |
/// | `groupId` | selects/creates the consumer group | `default` |
/// | `distinguishingField` (or `uniqueField`) | field used to tell logical updates apart | `timeStamp` |
/// | `nUpdatesPerConsumer` | updates before rotation | `1` |
/// | `updateMode` | `0` round robin, `1` broadcast | `0`, or `1` when `groupId` is given without `updateMode` |
#[derive(Clone, Debug, PartialEq)]
pub struct DistributorRequest {
    pub distributor_id: String,
    pub group_id: String,
    pub distinguishing_field: String,
    /// Kept signed so a non-positive request can be refused downstream
    pub updates_per_consumer: i64,
    pub mode: DispatchMode,
}

impl Default for DistributorRequest {
    fn default() -> Self {
        DistributorRequest {
            distributor_id: "default".to_owned(),
            group_id: "default".to_owned(),
            distinguishing_field: "timeStamp".to_owned(),
            updates_per_consumer: 1,
            mode: DispatchMode::OnePerGroup,
        }
    }
}

fn key_value(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(take_till1(|c| c == ':'), char(':'), rest).parse(input)
}

impl DistributorRequest {
    /// Parse a request string, logging and defaulting anything malformed.
    pub fn parse(input: &str) -> DistributorRequest {
        let mut request = DistributorRequest::default();
        let mut explicit_group = false;
        let mut explicit_mode = false;
        for element in input.split(';') {
            if element.trim().is_empty() {
                continue;
            }
            let Ok((_, (key, value))) = key_value(element) else {
                warn!("ignoring malformed request element {element:?}");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if value.is_empty() {
                warn!("ignoring request key {key} with empty value");
                continue;
            }
            if key.eq_ignore_ascii_case("distributorId") {
                request.distributor_id = value.to_owned();
            } else if key.eq_ignore_ascii_case("groupId") {
                request.group_id = value.to_owned();
                explicit_group = true;
            } else if key.eq_ignore_ascii_case("distinguishingField")
                || key.eq_ignore_ascii_case("uniqueField")
            {
                request.distinguishing_field = value.to_owned();
            } else if key.eq_ignore_ascii_case("nUpdatesPerConsumer") {
                match value.parse() {
                    Ok(n) => request.updates_per_consumer = n,
                    Err(_) => warn!("ignoring non-numeric nUpdatesPerConsumer {value:?}"),
                }
            } else if key.eq_ignore_ascii_case("updateMode") {
                match value {
                    "0" => {
                        request.mode = DispatchMode::OnePerGroup;
                        explicit_mode = true;
                    }
                    "1" => {
                        request.mode = DispatchMode::AllInGroup;
                        explicit_mode = true;
                    }
                    _ => warn!("ignoring unknown updateMode {value:?}"),
                }
            } else {
                warn!("ignoring unknown request key {key:?}");
            }
        }
        // Naming a group without choosing a mode means broadcast to it
        if explicit_group && !explicit_mode {
            request.mode = DispatchMode::AllInGroup;
        }
        request
    }
}
