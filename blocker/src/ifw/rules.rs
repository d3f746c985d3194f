// ABOUTME: models an intent firewall rule document and its xml encoding.
// ABOUTME: enforces unique filters per section and prunes empty sections before serialization.

use blocker_common::{ComponentCategory, ComponentIdentity};
use serde::{Deserialize, Serialize};

use crate::error::IfwError;

const ROOT_TAG: &str = "rules";

/// One `<component-filter name="pkg/component"/>` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentFilter {
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedEntry {
    #[serde(rename = "@name")]
    pub name: String,
}

/// Carried through load/save untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentFilter {
    #[serde(rename = "action", default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<NamedEntry>,
    #[serde(rename = "category", default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<NamedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSection {
    #[serde(rename = "@block", default = "default_block")]
    pub block: bool,
    #[serde(rename = "@log", default)]
    pub log: bool,
    #[serde(rename = "intent-filter", default, skip_serializing_if = "Vec::is_empty")]
    pub intent_filters: Vec<IntentFilter>,
    #[serde(rename = "component-filter", default)]
    pub component_filters: Vec<ComponentFilter>,
}

fn default_block() -> bool {
    true
}

impl Default for RuleSection {
    fn default() -> Self {
        Self {
            block: true,
            log: false,
            intent_filters: vec![],
            component_filters: vec![],
        }
    }
}

impl RuleSection {
    fn contains(&self, filter_name: &str) -> bool {
        self.component_filters.iter().any(|f| f.name == filter_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<RuleSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<RuleSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<RuleSection>,
}

impl Rules {
    pub fn parse(xml: &str) -> Result<Self, quick_xml::DeError> {
        quick_xml::de::from_str(xml)
    }

    pub fn to_xml(&self) -> Result<String, IfwError> {
        let mut buffer = String::new();
        let mut serializer = quick_xml::se::Serializer::with_root(&mut buffer, Some(ROOT_TAG))
            .map_err(|err| IfwError::Serialize(err.to_string()))?;
        serializer.indent(' ', 2);
        self.serialize(serializer)
            .map_err(|err| IfwError::Serialize(err.to_string()))?;
        buffer.push('\n');
        Ok(buffer)
    }

    fn slot_mut(&mut self, category: ComponentCategory) -> Result<&mut Option<RuleSection>, IfwError> {
        match category {
            ComponentCategory::Activity => Ok(&mut self.activity),
            ComponentCategory::Receiver => Ok(&mut self.broadcast),
            ComponentCategory::Service => Ok(&mut self.service),
            ComponentCategory::Provider => Err(IfwError::UnsupportedCategory(category)),
        }
    }

    pub fn section(&self, category: ComponentCategory) -> Option<&RuleSection> {
        match category {
            ComponentCategory::Activity => self.activity.as_ref(),
            ComponentCategory::Receiver => self.broadcast.as_ref(),
            ComponentCategory::Service => self.service.as_ref(),
            ComponentCategory::Provider => None,
        }
    }

    fn sections(&self) -> impl Iterator<Item = &RuleSection> {
        [&self.activity, &self.broadcast, &self.service]
            .into_iter()
            .flatten()
    }

    /// Returns false when the filter is already present in that section.
    pub fn add(&mut self, component: &ComponentIdentity, category: ComponentCategory) -> Result<bool, IfwError> {
        let filter_name = component.flatten();
        let section = self.slot_mut(category)?.get_or_insert_with(RuleSection::default);
        if section.contains(&filter_name) {
            return Ok(false);
        }
        section.component_filters.push(ComponentFilter { name: filter_name });
        Ok(true)
    }

    /// Returns whether any filter was removed.
    pub fn remove(&mut self, component: &ComponentIdentity, category: ComponentCategory) -> Result<bool, IfwError> {
        let filter_name = component.flatten();
        let Some(section) = self.slot_mut(category)?.as_mut() else {
            return Ok(false);
        };
        let before = section.component_filters.len();
        section.component_filters.retain(|f| f.name != filter_name);
        Ok(section.component_filters.len() != before)
    }

    /// Enabled unless a filter in any section names the component.
    pub fn is_enabled(&self, component: &ComponentIdentity) -> bool {
        let filter_name = component.flatten();
        !self.sections().any(|section| section.contains(&filter_name))
    }

    /// Drops sections without component filters; an empty section must never be persisted.
    pub fn prune(&mut self) {
        for slot in [&mut self.activity, &mut self.broadcast, &mut self.service] {
            if slot.as_ref().is_some_and(|s| s.component_filters.is_empty()) {
                *slot = None;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.activity.is_none() && self.broadcast.is_none() && self.service.is_none()
    }

    pub fn filter_count(&self) -> usize {
        self.sections().map(|s| s.component_filters.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<rules>
  <activity block="true" log="false">
    <intent-filter>
      <action name="android.intent.action.MAIN" />
      <category name="android.intent.category.LAUNCHER" />
    </intent-filter>
    <component-filter name="com.example.app/com.example.app.AdActivity" />
  </activity>
  <service block="true" log="true">
    <component-filter name="com.example.app/com.example.app.PushService" />
    <component-filter name="com.example.app/com.example.app.SyncService" />
  </service>
</rules>
"#;

    fn id(component: &str) -> ComponentIdentity {
        ComponentIdentity::new("com.example.app", component)
    }

    #[test]
    fn parses_sections_and_filters() {
        let rules = Rules::parse(SAMPLE).unwrap();
        let activity = rules.activity.as_ref().unwrap();
        assert!(activity.block);
        assert!(!activity.log);
        assert_eq!(activity.intent_filters.len(), 1);
        assert_eq!(activity.intent_filters[0].actions[0].name, "android.intent.action.MAIN");
        assert!(rules.broadcast.is_none());

        let service = rules.service.as_ref().unwrap();
        assert!(service.log);
        assert_eq!(service.component_filters.len(), 2);
        assert_eq!(rules.filter_count(), 3);
    }

    #[test]
    fn missing_attributes_take_defaults() {
        let rules = Rules::parse(
            r#"<rules><broadcast><component-filter name="a.b/C" /></broadcast></rules>"#,
        )
        .unwrap();
        let broadcast = rules.broadcast.unwrap();
        assert!(broadcast.block);
        assert!(!broadcast.log);
    }

    #[test]
    fn serialized_document_reads_back_the_same() {
        let rules = Rules::parse(SAMPLE).unwrap();
        let xml = rules.to_xml().unwrap();
        assert!(xml.starts_with("<rules>"));
        assert!(xml.contains(r#"<component-filter name="com.example.app/com.example.app.PushService"/>"#));
        assert!(!xml.contains("<broadcast"));
        assert_eq!(Rules::parse(&xml).unwrap(), rules);
    }

    #[test]
    fn add_creates_section_with_defaults() {
        let mut rules = Rules::default();
        assert!(rules.add(&id("MainReceiver"), ComponentCategory::Receiver).unwrap());

        let broadcast = rules.broadcast.as_ref().unwrap();
        assert!(broadcast.block);
        assert!(!broadcast.log);
        assert_eq!(broadcast.component_filters[0].name, "com.example.app/MainReceiver");
        assert!(!rules.is_enabled(&id("MainReceiver")));
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut rules = Rules::default();
        assert!(rules.add(&id("Main"), ComponentCategory::Activity).unwrap());
        assert!(!rules.add(&id("Main"), ComponentCategory::Activity).unwrap());
        assert_eq!(rules.activity.as_ref().unwrap().component_filters.len(), 1);
    }

    #[test]
    fn providers_are_not_routable() {
        let mut rules = Rules::default();
        let err = rules.add(&id("Provider"), ComponentCategory::Provider).unwrap_err();
        assert!(matches!(err, IfwError::UnsupportedCategory(ComponentCategory::Provider)));
        assert!(rules.remove(&id("Provider"), ComponentCategory::Provider).is_err());
    }

    #[test]
    fn remove_reports_whether_anything_changed() {
        let mut rules = Rules::parse(SAMPLE).unwrap();
        assert!(rules
            .remove(&id("com.example.app.PushService"), ComponentCategory::Service)
            .unwrap());
        assert!(!rules
            .remove(&id("com.example.app.PushService"), ComponentCategory::Service)
            .unwrap());
        assert!(!rules
            .remove(&id("com.example.app.PushService"), ComponentCategory::Receiver)
            .unwrap());
        assert!(rules.is_enabled(&id("com.example.app.PushService")));
    }

    #[test]
    fn enable_state_checks_every_section() {
        let rules = Rules::parse(SAMPLE).unwrap();
        assert!(!rules.is_enabled(&id("com.example.app.AdActivity")));
        assert!(!rules.is_enabled(&id("com.example.app.SyncService")));
        assert!(rules.is_enabled(&id("com.example.app.MainActivity")));
        assert!(rules.is_enabled(&ComponentIdentity::new("com.other", "com.example.app.AdActivity")));
    }

    #[test]
    fn prune_drops_empty_sections_only() {
        let mut rules = Rules::parse(SAMPLE).unwrap();
        rules
            .remove(&id("com.example.app.AdActivity"), ComponentCategory::Activity)
            .unwrap();
        rules.prune();
        assert!(rules.activity.is_none());
        assert!(rules.service.is_some());
        assert!(!rules.is_empty());

        let xml = rules.to_xml().unwrap();
        assert!(!xml.contains("<activity"));
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(Rules::parse("<rules><activity block=\"maybe\"></activity></rules>").is_err());
        assert!(Rules::parse("<rules><activity>").is_err());
    }
}
