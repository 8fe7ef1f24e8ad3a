use std::fmt::Write as _;

/// One named component block. The body is opaque text in the target's own
/// config dialect and is embedded as-is under the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDescriptor {
    pub name: String,
    pub body: String,
}

impl ComponentDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

/// Renders the config document handed to the target at startup.
///
/// The harness only assembles the document: `receiver` is where the target
/// accepts records from the harness sender, `exporter` is where it emits them
/// back to the harness receiver, and processors sit in between, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfigTemplate {
    pub pipeline_name: String,
    pub receiver: ComponentDescriptor,
    pub exporter: ComponentDescriptor,
    pub processors: Vec<ComponentDescriptor>,
}

impl TargetConfigTemplate {
    #[must_use]
    pub fn new(receiver: ComponentDescriptor, exporter: ComponentDescriptor) -> Self {
        Self {
            pipeline_name: "records".to_owned(),
            receiver,
            exporter,
            processors: Vec::new(),
        }
    }

    #[must_use]
    pub fn processor(mut self, processor: ComponentDescriptor) -> Self {
        self.processors.push(processor);
        self
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("receivers:\n");
        push_component(&mut out, &self.receiver);
        if !self.processors.is_empty() {
            out.push_str("processors:\n");
            for processor in &self.processors {
                push_component(&mut out, processor);
            }
        }
        out.push_str("exporters:\n");
        push_component(&mut out, &self.exporter);

        let processor_names = self
            .processors
            .iter()
            .map(|processor| processor.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(
            out,
            "service:\n  pipelines:\n    {}:\n      receivers: [{}]\n      processors: [{}]\n      exporters: [{}]\n",
            self.pipeline_name, self.receiver.name, processor_names, self.exporter.name
        );
        out
    }
}

fn push_component(out: &mut String, component: &ComponentDescriptor) {
    let _ = writeln!(out, "  {}:", component.name);
    for line in component.body.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let _ = writeln!(out, "    {line}");
    }
}
