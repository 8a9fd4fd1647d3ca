//! Model description loading.
//!
//! The model description lists the variables exposed to the host:
//!
//! ```xml
//! <fmiModelDescription modelName="ecu" guid="{...}">
//!   <ModelVariables>
//!     <ScalarVariable name="speed" valueReference="1" causality="input"
//!                     variability="continuous" declaredType="sint16">
//!       <Real start="0.0" factor="0.1" offset="0"/>
//!     </ScalarVariable>
//!   </ModelVariables>
//! </fmiModelDescription>
//! ```
//!
//! `declaredType` names the element type of the variable in worker memory.
//! Optional `factor` and `offset` attributes on the type element enable
//! quantization.

use std::path::{Path, PathBuf};

use fnv::FnvHashMap;
use roxmltree::{Document, Node};

use crate::error::{Error, Result};
use crate::registry::SlotDecl;
use crate::util;
use crate::var::{Causality, ElementType, Quantization, Value, ValueKind};
use crate::DEFAULT_RESOURCES_DIR;

pub const MODEL_DESCRIPTION_FILE: &str = "modelDescription.xml";

const ROOT_ELEMENT: &str = "fmiModelDescription";
const MODEL_VARIABLES: &str = "ModelVariables";
const SCALAR_VARIABLE: &str = "ScalarVariable";

/// Single variable as declared in the model description.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelVariable {
    pub name: String,
    pub reference: u32,
    pub kind: ValueKind,
    pub element_type: ElementType,
    pub causality: Causality,
    pub variability: String,
    pub start: Option<String>,
    pub quantization: Quantization,
    pub mime_type: Option<String>,
}

impl ModelVariable {
    pub fn start_value(&self) -> Value {
        match &self.start {
            Some(literal) => Value::parse_start(self.kind, literal),
            None => Value::zero(self.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescription {
    pub model_name: String,
    pub guid: String,
    pub variables: Vec<ModelVariable>,
}

impl ModelDescription {
    /// Locates the model description under a model root directory, looking
    /// in the root first and in the resources directory second.
    pub fn locate(root: &Path) -> Result<PathBuf> {
        let candidates = [
            root.join(MODEL_DESCRIPTION_FILE),
            root.join(DEFAULT_RESOURCES_DIR).join(MODEL_DESCRIPTION_FILE),
        ];
        candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .ok_or_else(|| Error::ModelDescription {
                path: root.to_path_buf(),
                reason: format!("no {} found", MODEL_DESCRIPTION_FILE),
            })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = util::read_text_file(path).map_err(|e| Error::ModelDescription {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(path, &text)
    }

    /// Parses model description text. `path` is only used for error
    /// reporting.
    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let malformed = |reason: String| Error::ModelDescription {
            path: path.to_path_buf(),
            reason,
        };
        let doc = Document::parse(text).map_err(|e| malformed(e.to_string()))?;
        let root = doc.root_element();
        if !root.has_tag_name(ROOT_ELEMENT) {
            return Err(malformed(format!(
                "root element is `{}`, expected `{}`",
                root.tag_name().name(),
                ROOT_ELEMENT
            )));
        }

        let mut variables = Vec::new();
        let scalars = root
            .children()
            .filter(|n| n.has_tag_name(MODEL_VARIABLES))
            .flat_map(|n| n.children())
            .filter(|n| n.has_tag_name(SCALAR_VARIABLE));
        for node in scalars {
            variables.push(parse_variable(node).map_err(malformed)?);
        }

        Ok(ModelDescription {
            model_name: root.attribute("modelName").unwrap_or("").to_string(),
            guid: root.attribute("guid").unwrap_or("").to_string(),
            variables,
        })
    }

    /// Slot declarations for all variables. Variables of the same kind
    /// sharing a value reference form a group, indexed in document order.
    pub fn declarations(&self) -> Vec<SlotDecl> {
        let mut next_index: FnvHashMap<(ValueKind, u32), u32> = FnvHashMap::default();
        self.variables
            .iter()
            .map(|var| {
                let index = next_index.entry((var.kind, var.reference)).or_insert(0);
                let decl = SlotDecl {
                    reference: var.reference,
                    index: *index,
                    name: var.name.clone(),
                    element_type: var.element_type,
                    causality: var.causality,
                    variability: var.variability.clone(),
                    quantization: var.quantization,
                    start: var.start_value(),
                };
                *index += 1;
                decl
            })
            .collect()
    }
}

fn parse_variable(node: Node) -> std::result::Result<ModelVariable, String> {
    let name = node
        .attribute("name")
        .ok_or_else(|| "variable without a name".to_string())?;
    let reference = node
        .attribute("valueReference")
        .ok_or_else(|| format!("`{}`: missing valueReference", name))?
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("`{}`: invalid valueReference: {}", name, e))?;

    let (type_node, kind, is_enumeration) = node
        .children()
        .filter(|n| n.is_element())
        .find_map(|n| {
            ValueKind::from_element_name(n.tag_name().name()).map(|(k, e)| (n, k, e))
        })
        .ok_or_else(|| format!("`{}`: no type element", name))?;

    let element_type = match node.attribute("declaredType") {
        Some(declared) => {
            let et = ElementType::from_name(declared);
            if et == ElementType::Unset {
                warn!("`{}`: unknown declared type `{}`", name, declared);
            }
            et
        }
        None => ElementType::default_for(kind, is_enumeration),
    };

    let quantization = match (type_node.attribute("factor"), type_node.attribute("offset")) {
        (None, None) => Quantization::default(),
        (factor, offset) => Quantization::new(
            parse_f64_attr(name, "factor", factor, 1.0)?,
            parse_f64_attr(name, "offset", offset, 0.0)?,
        ),
    };

    Ok(ModelVariable {
        name: name.to_string(),
        reference,
        kind,
        element_type,
        causality: Causality::from_name(node.attribute("causality").unwrap_or("")),
        variability: node.attribute("variability").unwrap_or("").to_string(),
        start: type_node.attribute("start").map(|s| s.to_string()),
        quantization,
        mime_type: type_node.attribute("mimeType").map(|s| s.to_string()),
    })
}

fn parse_f64_attr(
    var: &str,
    attr: &str,
    value: Option<&str>,
    default: f64,
) -> std::result::Result<f64, String> {
    match value {
        Some(v) => v
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("`{}`: invalid {}: {}", var, attr, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<fmiModelDescription fmiVersion="2.0" modelName="ecu" guid="{1234}">
  <ModelVariables>
    <ScalarVariable name="speed" valueReference="1" causality="input" variability="continuous" declaredType="sint16">
      <Real start="2.5" factor="0.5" offset="1"/>
    </ScalarVariable>
    <ScalarVariable name="arr[0]" valueReference="2" causality="output">
      <Integer start="0x10"/>
    </ScalarVariable>
    <ScalarVariable name="arr[1]" valueReference="2" causality="output">
      <Integer/>
    </ScalarVariable>
    <ScalarVariable name="mode" valueReference="2" causality="local">
      <Enumeration start="3"/>
    </ScalarVariable>
    <ScalarVariable name="label" valueReference="4" causality="parameter">
      <String start="hello"/>
    </ScalarVariable>
    <ScalarVariable name="blob" valueReference="5" causality="input">
      <Binary mimeType="application/octet-stream"/>
    </ScalarVariable>
  </ModelVariables>
</fmiModelDescription>"#;

    fn description() -> ModelDescription {
        ModelDescription::parse(Path::new("modelDescription.xml"), DESCRIPTION).unwrap()
    }

    #[test]
    fn variables_are_parsed() {
        let md = description();
        assert_eq!(md.model_name, "ecu");
        assert_eq!(md.variables.len(), 6);

        let speed = &md.variables[0];
        assert_eq!(speed.kind, ValueKind::Real);
        assert_eq!(speed.element_type, ElementType::Sint16);
        assert_eq!(speed.causality, Causality::Input);
        assert_eq!(speed.quantization, Quantization::new(0.5, 1.0));
        assert_eq!(speed.start_value(), Value::Real(2.5));

        let mode = &md.variables[3];
        assert_eq!(mode.kind, ValueKind::Integer);
        assert_eq!(mode.element_type, ElementType::Enumeration);
        assert_eq!(mode.causality, Causality::Unset);

        assert_eq!(md.variables[5].mime_type.as_deref(), Some("application/octet-stream"));
    }

    #[test]
    fn groups_are_indexed_per_kind_and_reference() {
        let decls = description().declarations();
        let idx: Vec<(u32, u32)> = decls.iter().map(|d| (d.reference, d.index)).collect();
        assert_eq!(idx, vec![(1, 0), (2, 0), (2, 1), (2, 2), (4, 0), (5, 0)]);
        assert_eq!(decls[1].start, Value::Integer(16));
        assert_eq!(decls[2].start, Value::Integer(0));
    }

    #[test]
    fn bad_documents_fail() {
        let p = Path::new("md.xml");
        assert!(ModelDescription::parse(p, "<other/>").is_err());
        assert!(ModelDescription::parse(
            p,
            r#"<fmiModelDescription><ModelVariables>
               <ScalarVariable name="x" valueReference="q"><Real/></ScalarVariable>
               </ModelVariables></fmiModelDescription>"#
        )
        .is_err());
        assert!(ModelDescription::parse(
            p,
            r#"<fmiModelDescription><ModelVariables>
               <ScalarVariable name="x" valueReference="1"/>
               </ModelVariables></fmiModelDescription>"#
        )
        .is_err());
    }

    #[test]
    fn locate_prefers_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModelDescription::locate(dir.path()).is_err());
        std::fs::create_dir(dir.path().join("resources")).unwrap();
        std::fs::write(
            dir.path().join("resources").join(MODEL_DESCRIPTION_FILE),
            DESCRIPTION,
        )
        .unwrap();
        let found = ModelDescription::locate(dir.path()).unwrap();
        assert!(found.ends_with("resources/modelDescription.xml"));
        std::fs::write(dir.path().join(MODEL_DESCRIPTION_FILE), DESCRIPTION).unwrap();
        assert_eq!(
            ModelDescription::locate(dir.path()).unwrap(),
            dir.path().join(MODEL_DESCRIPTION_FILE)
        );
    }
}
