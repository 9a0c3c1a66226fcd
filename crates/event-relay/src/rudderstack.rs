// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in rules translating PostHog-style product analytics events into the RudderStack
//! event specification (`track`, `page`, `identify`, `alias`, `group`).

use serde_json::json;

use crate::mapping::{EventTypeRule, MappingTable, MappingValue, PayloadMapper, RuleSet};

pub const APP_NAME: &str = "PostHogPlugin";
pub const CHANNEL: &str = "s2s";

/// Literal fields present on every outbound event.
#[must_use]
pub fn constants() -> MappingTable {
    MappingTable::direct([
        ("context.app.name", json!(APP_NAME)),
        ("channel", json!(CHANNEL)),
    ])
}

/// Context and identity fields shared by every event type.
#[must_use]
pub fn generic() -> MappingTable {
    MappingTable::paths([
        ("context.os.name", MappingValue::from("properties.$os")),
        ("context.browser", MappingValue::from("properties.$browser")),
        ("context.page.host", MappingValue::from("properties.$host")),
        ("context.page.url", MappingValue::from("properties.$current_url")),
        ("context.page.path", MappingValue::from("properties.$pathname")),
        ("context.page.referrer", MappingValue::from("properties.$referrer")),
        (
            "context.page.initial_referrer",
            MappingValue::from("properties.$initial_referrer"),
        ),
        (
            "context.page.referring_domain",
            MappingValue::from("properties.$referring_domain"),
        ),
        ("context.app.version", MappingValue::from("properties.posthog_version")),
        (
            "context.page.initial_referring_domain",
            MappingValue::from("properties.$initial_referring_domain"),
        ),
        (
            "context.browser_version",
            MappingValue::from("properties.$browser_version"),
        ),
        ("context.screen.height", MappingValue::from("properties.$screen_height")),
        ("context.screen.width", MappingValue::from("properties.$screen_width")),
        ("context.library.name", MappingValue::from("properties.$lib")),
        ("context.library.version", MappingValue::from("properties.$lib_version")),
        ("context.ip", MappingValue::from("ip")),
        ("messageId", MappingValue::from("$insert_id")),
        ("originalTimestamp", MappingValue::from("sent_at")),
        ("userId", MappingValue::from(["$user_id", "distinct_id"])),
        (
            "anonymousId",
            MappingValue::from([
                "properties.$anon_distinct_id",
                "properties.$device_id",
                "properties.distinct_id",
            ]),
        ),
        (
            "context.active_feature_flags",
            MappingValue::from("properties.$active_feature_flags"),
        ),
        ("context.posthog_version", MappingValue::from("properties.posthog_version")),
        (
            "context.has_slack_webhook",
            MappingValue::from("properties.has_slack_webhook"),
        ),
        ("context.token", MappingValue::from("properties.token")),
    ])
}

#[must_use]
pub fn page() -> MappingTable {
    MappingTable::paths([
        ("name", "properties.name"),
        ("properties.category", "properties.category"),
        ("properties.host", "properties.$host"),
        ("properties.url", "properties.$current_url"),
        ("properties.path", "properties.$pathname"),
        ("properties.referrer", "properties.$referrer"),
        ("properties.initial_referrer", "properties.$initial_referrer"),
        ("properties.referring_domain", "properties.$referring_domain"),
        (
            "properties.initial_referring_domain",
            "properties.$initial_referring_domain",
        ),
    ])
}

#[must_use]
pub fn identify() -> MappingTable {
    MappingTable::paths([("context.traits", "$set"), ("traits", "$set")])
}

#[must_use]
pub fn alias() -> MappingTable {
    MappingTable::paths([
        ("userId", MappingValue::from("properties.alias")),
        ("previousId", MappingValue::from(["properties.distinct_id"])),
    ])
}

#[must_use]
pub fn group() -> MappingTable {
    MappingTable::paths([("groupId", "groupId"), ("traits", "traits")])
}

#[must_use]
pub fn track() -> MappingTable {
    MappingTable::paths([("event", "event")])
}

#[must_use]
pub fn autocapture() -> MappingTable {
    MappingTable::paths([
        ("event", "properties.$event_type"),
        ("properties.elements", "properties.$elements"),
    ])
}

/// Event name to output type. Unknown names fall back to `track`.
#[must_use]
pub fn rules() -> RuleSet {
    RuleSet::new(EventTypeRule::new("track", track()))
        .with_rule("$identify", EventTypeRule::new("identify", identify()))
        .with_rule("$create_alias", EventTypeRule::new("alias", alias()))
        .with_rule("$pageview", EventTypeRule::new("page", page()))
        .with_rule("$page", EventTypeRule::new("page", page()))
        .with_rule("$group", EventTypeRule::new("group", group()))
        .with_rule("$autocapture", EventTypeRule::new("track", autocapture()))
}

#[must_use]
pub fn default_mapper() -> PayloadMapper {
    PayloadMapper::new(rules())
        .with_constants(constants())
        .with_generic(generic())
}
