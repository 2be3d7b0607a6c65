use crate::domain::DeviceKind;

/// MQTT topic tree below a configurable root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    root: String,
}

impl Topics {
    pub fn new(root: impl Into<String>) -> Self {
        let root: String = root.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn mode_set(&self) -> String {
        format!("{}/mode/set", self.root)
    }

    pub fn mode_actual(&self) -> String {
        format!("{}/mode/actual", self.root)
    }

    pub fn locked(&self) -> String {
        format!("{}/locked", self.root)
    }

    pub fn state(&self, kind: DeviceKind) -> String {
        format!("{}/{}/state", self.root, kind.topic_segment())
    }

    pub fn power(&self, kind: DeviceKind) -> String {
        format!("{}/{}/p", self.root, kind.topic_segment())
    }

    pub fn energy(&self, kind: DeviceKind) -> String {
        format!("{}/{}/e", self.root, kind.topic_segment())
    }

    /// `{root}/bat/dev/{name}/{point}`, point being `v`, `temp/0`, ...
    pub fn battery(&self, name: &str, point: &str) -> String {
        format!("{}/bat/dev/{}/{}", self.root, name, point)
    }

    pub fn battery_forward(&self, name: &str) -> String {
        format!("{}/bat/fwd/{}", self.root, name)
    }

    pub fn battery_forward_filter(&self) -> String {
        format!("{}/bat/fwd/+", self.root)
    }

    /// Pack name of a forwarded-battery topic
    pub fn battery_forward_name<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.root.as_str())?.strip_prefix("/bat/fwd/")?;
        (!rest.is_empty() && !rest.contains('/')).then_some(rest)
    }
}

/// MQTT filter matching with `+` (one level) and a trailing `#`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for f in filter.split('/') {
        match (f, levels.next()) {
            ("#", _) => return true,
            ("+", Some(_)) => {}
            (f, Some(t)) if f == t => {}
            _ => return false,
        }
    }
    levels.next().is_none()
}
