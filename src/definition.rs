//! Flow definitions (v0.1)
//!
//! A [`Definition`] is the immutable graph a flow instance executes: tasks,
//! links, attributes, mappers, and the optional error-handler subgraph.
//! Tasks and links are stored in id-keyed maps; all graph navigation is by
//! id, so the graph carries no reciprocal references.
//!
//! The serializable `*Rep` types mirror the wire JSON, including the
//! `ouputMappings` spelling kept for compatibility with existing flows.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::linkexpr::LinkExprManager;
use crate::mapper::{Mapper, Mapping};
use crate::scope::Attribute;

pub type TaskId = u32;
pub type LinkId = u32;

/// Kind of a link (wire values 0..3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LinkType {
    /// Control dependency, always true
    Dependency = 0,
    /// Guarded by a boolean expression
    Expression = 1,
    /// Labelled, no runtime semantics of its own
    Label = 2,
    /// Error propagation
    Error = 3,
}

impl TryFrom<u8> for LinkType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(LinkType::Dependency),
            1 => Ok(LinkType::Expression),
            2 => Ok(LinkType::Label),
            3 => Ok(LinkType::Error),
            other => Err(format!("unknown link type {other}")),
        }
    }
}

impl From<LinkType> for u8 {
    fn from(t: LinkType) -> u8 {
        t as u8
    }
}

/// A directed edge between two tasks
#[derive(Debug, Clone)]
pub struct Link {
    pub id: LinkId,
    pub link_type: LinkType,
    pub value: String,
    pub from_task: TaskId,
    pub to_task: TaskId,
}

/// A node of the flow graph, optionally bound to an activity type
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub type_id: u32,
    pub activity_type: String,
    pub name: String,
    pub attrs: Vec<Attribute>,
    pub input_mapper: Option<Mapper>,
    pub output_mapper: Option<Mapper>,
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub from_links: Vec<LinkId>,
    pub to_links: Vec<LinkId>,
}

impl Task {
    /// A task is a scope iff it introduces attributes of its own
    pub fn is_scope(&self) -> bool {
        !self.attrs.is_empty()
    }

    /// Whether the task participates in attribute mapping at all
    pub fn has_attrs(&self) -> bool {
        !self.activity_type.is_empty() || self.is_scope()
    }
}

/// Immutable flow graph, shared between instances via `Arc`
#[derive(Debug)]
pub struct Definition {
    name: String,
    model_id: String,
    explicit_reply: bool,
    attrs: HashMap<String, Attribute>,
    input_mapper: Option<Mapper>,
    root_task_id: TaskId,
    eh_task_id: Option<TaskId>,
    tasks: HashMap<TaskId, Arc<Task>>,
    links: HashMap<LinkId, Arc<Link>>,
    link_expr_mgr: LinkExprManager,
}

impl Definition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn explicit_reply(&self) -> bool {
        self.explicit_reply
    }

    pub fn root_task_id(&self) -> TaskId {
        self.root_task_id
    }

    pub fn error_handler_task_id(&self) -> Option<TaskId> {
        self.eh_task_id
    }

    pub fn task(&self, id: TaskId) -> Option<&Arc<Task>> {
        self.tasks.get(&id)
    }

    pub fn link(&self, id: LinkId) -> Option<&Arc<Link>> {
        self.links.get(&id)
    }

    pub fn get_attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(name)
    }

    pub fn input_mapper(&self) -> Option<&Mapper> {
        self.input_mapper.as_ref()
    }

    pub fn link_expr_mgr(&self) -> &LinkExprManager {
        &self.link_expr_mgr
    }

    /// Parse and validate a definition from its JSON representation
    pub fn from_json(json: &[u8]) -> Result<Arc<Self>, DefinitionError> {
        let rep: DefinitionRep = serde_json::from_slice(json)?;
        Self::from_rep(rep)
    }

    /// Build and validate a definition from its serializable representation
    pub fn from_rep(rep: DefinitionRep) -> Result<Arc<Self>, DefinitionError> {
        let mut builder = Builder::default();

        let root_task_id = rep.root_task.id;
        builder.add_task(&rep.root_task, None)?;
        builder.add_links(&rep.root_task)?;
        let root_set: Vec<TaskId> = builder.tasks.keys().copied().collect();

        let eh_task_id = match &rep.error_handler_task {
            Some(eh) => {
                builder.add_task(eh, None)?;
                builder.add_links(eh)?;
                Some(eh.id)
            }
            None => None,
        };

        builder.wire_links(&root_set)?;

        let mut attrs = HashMap::with_capacity(rep.attributes.len());
        for attr in rep.attributes {
            attrs.insert(attr.name.clone(), attr);
        }

        let input_mapper = rep.input_mappings.map(Mapper::new);

        let link_expr_mgr = LinkExprManager::new(builder.links.values());

        let tasks = builder
            .tasks
            .into_iter()
            .map(|(id, t)| (id, Arc::new(t)))
            .collect();
        let links = builder
            .links
            .into_iter()
            .map(|(id, l)| (id, Arc::new(l)))
            .collect();

        Ok(Arc::new(Self {
            name: rep.name,
            model_id: rep.model_id,
            explicit_reply: rep.explicit_reply,
            attrs,
            input_mapper,
            root_task_id,
            eh_task_id,
            tasks,
            links,
            link_expr_mgr,
        }))
    }
}

/// Definition load or validation failure
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("duplicate task id {0}")]
    DuplicateTask(TaskId),

    #[error("duplicate link id {0}")]
    DuplicateLink(LinkId),

    #[error("link {id} references unknown task {task}")]
    UnknownLinkEndpoint { id: LinkId, task: TaskId },

    #[error("link {0} crosses between the main flow and the error handler")]
    LinkCrossesSubgraph(LinkId),

    #[error("invalid flow JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Default)]
struct Builder {
    tasks: HashMap<TaskId, Task>,
    links: HashMap<LinkId, Link>,
}

impl Builder {
    fn add_task(&mut self, rep: &TaskRep, parent: Option<TaskId>) -> Result<(), DefinitionError> {
        if self.tasks.contains_key(&rep.id) {
            return Err(DefinitionError::DuplicateTask(rep.id));
        }

        let task = Task {
            id: rep.id,
            type_id: rep.type_id,
            activity_type: rep.activity_type.clone(),
            name: rep.name.clone(),
            attrs: rep.attributes.clone(),
            input_mapper: rep.input_mappings.clone().map(Mapper::new),
            output_mapper: rep.output_mappings.clone().map(Mapper::new),
            parent,
            children: rep.tasks.iter().map(|t| t.id).collect(),
            from_links: Vec::new(),
            to_links: Vec::new(),
        };
        self.tasks.insert(rep.id, task);

        for child in &rep.tasks {
            self.add_task(child, Some(rep.id))?;
        }
        Ok(())
    }

    fn add_links(&mut self, rep: &TaskRep) -> Result<(), DefinitionError> {
        for link_rep in &rep.links {
            if self.links.contains_key(&link_rep.id) {
                return Err(DefinitionError::DuplicateLink(link_rep.id));
            }
            self.links.insert(
                link_rep.id,
                Link {
                    id: link_rep.id,
                    link_type: link_rep.link_type,
                    value: link_rep.value.clone(),
                    from_task: link_rep.from,
                    to_task: link_rep.to,
                },
            );
        }

        for child in &rep.tasks {
            self.add_links(child)?;
        }
        Ok(())
    }

    /// Resolve link endpoints and fill the tasks' from/to link lists.
    /// The error handler must stay a standalone subgraph: no link may span
    /// the two task sets.
    fn wire_links(&mut self, root_set: &[TaskId]) -> Result<(), DefinitionError> {
        let mut link_ids: Vec<LinkId> = self.links.keys().copied().collect();
        link_ids.sort_unstable();

        for id in link_ids {
            let (from, to) = {
                let link = &self.links[&id];
                (link.from_task, link.to_task)
            };

            for endpoint in [from, to] {
                if !self.tasks.contains_key(&endpoint) {
                    return Err(DefinitionError::UnknownLinkEndpoint { id, task: endpoint });
                }
            }

            if root_set.contains(&from) != root_set.contains(&to) {
                return Err(DefinitionError::LinkCrossesSubgraph(id));
            }

            if let Some(t) = self.tasks.get_mut(&to) {
                t.from_links.push(id);
            }
            if let Some(t) = self.tasks.get_mut(&from) {
                t.to_links.push(id);
            }
        }
        Ok(())
    }
}

// ============================================================================
// WIRE REPRESENTATION
// ============================================================================

/// Serializable representation of a flow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionRep {
    #[serde(default)]
    pub explicit_reply: bool,
    pub name: String,
    #[serde(rename = "model")]
    pub model_id: String,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub input_mappings: Option<Vec<Mapping>>,
    pub root_task: TaskRep,
    #[serde(default)]
    pub error_handler_task: Option<TaskRep>,
}

/// Serializable representation of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRep {
    pub id: TaskId,
    #[serde(rename = "type", default)]
    pub type_id: u32,
    #[serde(default)]
    pub activity_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub input_mappings: Option<Vec<Mapping>>,
    // spelling kept for compatibility with existing flow files
    #[serde(rename = "ouputMappings", default)]
    pub output_mappings: Option<Vec<Mapping>>,
    #[serde(default)]
    pub tasks: Vec<TaskRep>,
    #[serde(default)]
    pub links: Vec<LinkRep>,
}

/// Serializable representation of a link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRep {
    pub id: LinkId,
    #[serde(rename = "type", default = "default_link_type")]
    pub link_type: LinkType,
    #[serde(default)]
    pub name: String,
    pub from: TaskId,
    pub to: TaskId,
    #[serde(default)]
    pub value: String,
}

fn default_link_type() -> LinkType {
    LinkType::Dependency
}
