use chrono::Utc;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::logic::commit::load_owned_instance;
use crate::logic::marketplace::category_counts;
use crate::logic::registry::visible_definitions;
use crate::model::{
    generate_id, Blueprint, BlueprintEdge, BlueprintNode, BlockNode, CategoryCount, Connection, Id,
    Instance,
    Page, PreviewDefinition, RatingAggregate, Template, TemplateMetadata,
    TemplatePreview, TemplateUpdate, UserContext,
};
use crate::store::traits::{Expect, Store, WriteBatch, WriteOp};

const MAX_NAME_LEN: usize = 255;
const MAX_DESCRIPTION_LEN: usize = 1000;
const MAX_INSTANCE_NAME_LEN: usize = 100;

fn check_name(name: &str) -> EngineResult<String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(EngineError::validation(format!(
            "Template name must be 1..={} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

fn check_description(description: &Option<String>) -> EngineResult<()> {
    match description {
        Some(d) if d.chars().count() > MAX_DESCRIPTION_LEN => Err(EngineError::validation(
            format!(
                "Template description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            ),
        )),
        _ => Ok(()),
    }
}

fn check_category(category: &str) -> EngineResult<String> {
    let category = category.trim();
    if category.is_empty() {
        return Err(EngineError::validation("Template category is required"));
    }
    Ok(category.to_string())
}

/// Capture an instance's topology with ids swapped for local keys and
/// positions shifted so the top-left block sits at the origin
pub(crate) fn blueprint_of(instance: &Instance) -> Blueprint {
    let origin_x = instance
        .blocks
        .iter()
        .map(|b| b.position.x)
        .fold(f64::INFINITY, f64::min);
    let origin_y = instance
        .blocks
        .iter()
        .map(|b| b.position.y)
        .fold(f64::INFINITY, f64::min);
    let (origin_x, origin_y) = if instance.blocks.is_empty() {
        (0.0, 0.0)
    } else {
        (origin_x, origin_y)
    };

    let keys: HashMap<&str, String> = instance
        .blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.id.as_str(), format!("node-{}", i + 1)))
        .collect();

    let nodes = instance
        .blocks
        .iter()
        .map(|b| BlueprintNode {
            key: keys[b.id.as_str()].clone(),
            definition_id: b.definition_id.clone(),
            config: b.config.clone(),
            position: b.position.offset(-origin_x, -origin_y),
            label: b.label.clone(),
        })
        .collect();

    let edges = instance
        .connections
        .iter()
        .filter_map(|c| {
            Some(BlueprintEdge {
                source_key: keys.get(c.source_id.as_str())?.clone(),
                source_port: c.source_port.clone(),
                target_key: keys.get(c.target_id.as_str())?.clone(),
                target_port: c.target_port.clone(),
                config: c.config.clone(),
            })
        })
        .collect();

    Blueprint { nodes, edges }
}

/// Materialize a blueprint into fresh blocks and connections
pub(crate) fn materialize(blueprint: &Blueprint) -> (Vec<BlockNode>, Vec<Connection>) {
    let ids: HashMap<&str, Id> = blueprint
        .nodes
        .iter()
        .map(|n| (n.key.as_str(), generate_id()))
        .collect();

    let blocks = blueprint
        .nodes
        .iter()
        .map(|n| BlockNode {
            id: ids[n.key.as_str()].clone(),
            definition_id: n.definition_id.clone(),
            config: n.config.clone(),
            position: n.position,
            label: n.label.clone(),
        })
        .collect();

    let connections = blueprint
        .edges
        .iter()
        .filter_map(|e| {
            Some(Connection {
                id: generate_id(),
                source_id: ids.get(e.source_key.as_str())?.clone(),
                source_port: e.source_port.clone(),
                target_id: ids.get(e.target_key.as_str())?.clone(),
                target_port: e.target_port.clone(),
                config: e.config.clone(),
            })
        })
        .collect();

    (blocks, connections)
}

/// Reusable blueprints captured from instances
pub struct TemplateService<S> {
    store: Arc<S>,
    settings: EngineSettings,
}

impl<S: Store> TemplateService<S> {
    pub fn new(store: Arc<S>, settings: EngineSettings) -> Self {
        Self { store, settings }
    }

    /// Load a template the actor may see
    async fn load_visible(&self, actor: &UserContext, template_id: &Id) -> EngineResult<Template> {
        match self.store.get_template(template_id).await? {
            Some(template) if template.is_visible_to(&actor.user_id) => Ok(template),
            _ => Err(EngineError::not_found("template", template_id.clone())),
        }
    }

    async fn load_owned(&self, actor: &UserContext, template_id: &Id) -> EngineResult<Template> {
        match self.store.get_template(template_id).await? {
            Some(template) if actor.owns(&template.owner_id) => Ok(template),
            _ => Err(EngineError::not_found("template", template_id.clone())),
        }
    }

    pub async fn create_from_instance(
        &self,
        actor: &UserContext,
        instance_id: &Id,
        metadata: TemplateMetadata,
    ) -> EngineResult<Template> {
        let name = check_name(&metadata.name)?;
        check_description(&metadata.description)?;
        let category = check_category(&metadata.category)?;

        let instance = load_owned_instance(self.store.as_ref(), actor, instance_id).await?;
        let now = Utc::now();
        let template = Template {
            id: generate_id(),
            owner_id: actor.user_id.clone(),
            name,
            description: metadata.description,
            category,
            difficulty: metadata.difficulty,
            tags: metadata.tags,
            blueprint: blueprint_of(&instance),
            is_public: metadata.is_public,
            rating: RatingAggregate::default(),
            usage_count: 0,
            source_instance_id: Some(instance.id.clone()),
            created_at: now,
            updated_at: now,
        };

        self.store
            .apply(WriteBatch::single(WriteOp::PutTemplate(template.clone())))
            .await?;

        info!(
            "Created template '{}' ({}) from instance {} with {} nodes",
            template.name,
            template.id,
            instance_id,
            template.blueprint.nodes.len()
        );
        Ok(template)
    }

    /// Build the instance a template would produce for the actor, plus the
    /// writes that persist it and count the use. Callers may append further
    /// ops before applying the batch.
    pub(crate) async fn prepare_instantiation(
        &self,
        actor: &UserContext,
        template_id: &Id,
        name: Option<String>,
        description: Option<String>,
    ) -> EngineResult<(Instance, WriteBatch)> {
        let template = self.load_visible(actor, template_id).await?;

        let needed = template.blueprint.definition_ids();
        let available = visible_definitions(self.store.as_ref(), actor, &needed).await?;
        if let Some(missing) = needed.iter().find(|id| !available.contains_key(*id)) {
            return Err(EngineError::missing_definition(missing.clone()));
        }

        let name = name.unwrap_or_else(|| {
            template
                .name
                .chars()
                .take(MAX_INSTANCE_NAME_LEN)
                .collect::<String>()
        });
        let mut instance = Instance::new(
            actor.user_id.clone(),
            name,
            description.or_else(|| template.description.clone()),
        );
        let (blocks, connections) = materialize(&template.blueprint);
        instance.blocks = blocks;
        instance.connections = connections;
        instance.source_template_id = Some(template.id.clone());

        let batch = WriteBatch::new()
            .with(WriteOp::PutInstance {
                instance: instance.clone(),
                expect: Expect::Absent,
            })
            .with(WriteOp::IncrementTemplateUsage {
                template_id: template.id.clone(),
            });
        Ok((instance, batch))
    }

    /// New draft instance owned by the actor; the template's usage count is
    /// bumped in the same write
    pub async fn instantiate(
        &self,
        actor: &UserContext,
        template_id: &Id,
    ) -> EngineResult<Instance> {
        let (instance, batch) = self
            .prepare_instantiation(actor, template_id, None, None)
            .await?;
        self.store.apply(batch).await?;

        info!(
            "Instantiated template {} as instance {} for {}",
            template_id, instance.id, actor.user_id
        );
        Ok(instance)
    }

    pub async fn get(&self, actor: &UserContext, template_id: &Id) -> EngineResult<Template> {
        self.load_visible(actor, template_id).await
    }

    /// Summary of what instantiating would produce for the actor
    pub async fn preview(
        &self,
        actor: &UserContext,
        template_id: &Id,
    ) -> EngineResult<TemplatePreview> {
        let template = self.load_visible(actor, template_id).await?;
        let ids = template.blueprint.definition_ids();
        let available = visible_definitions(self.store.as_ref(), actor, &ids).await?;

        let definitions = ids
            .iter()
            .map(|id| {
                let definition = available.get(id);
                PreviewDefinition {
                    definition_id: id.clone(),
                    name: definition.map(|d| d.name.clone()),
                    category: definition.map(|d| d.category.clone()),
                    uses: template
                        .blueprint
                        .nodes
                        .iter()
                        .filter(|n| &n.definition_id == id)
                        .count(),
                }
            })
            .collect();

        Ok(TemplatePreview {
            id: template.id.clone(),
            name: template.name.clone(),
            description: template.description.clone(),
            category: template.category.clone(),
            difficulty: template.difficulty,
            block_count: template.blueprint.nodes.len(),
            connection_count: template.blueprint.edges.len(),
            definitions,
            unavailable_definitions: ids
                .into_iter()
                .filter(|id| !available.contains_key(id))
                .collect(),
            rating: template.rating,
            usage_count: template.usage_count,
        })
    }

    /// Public templates, most used first
    pub async fn list_public(
        &self,
        category: Option<&str>,
        page: Option<usize>,
        per_page: Option<usize>,
    ) -> EngineResult<Page<Template>> {
        let mut templates: Vec<Template> = self
            .store
            .list_templates()
            .await?
            .into_iter()
            .filter(|t| t.is_public)
            .filter(|t| category.map_or(true, |c| t.category.eq_ignore_ascii_case(c)))
            .collect();
        templates.sort_by(|a, b| {
            b.usage_count
                .cmp(&a.usage_count)
                .then_with(|| a.name.cmp(&b.name))
        });

        Ok(Page::from_vec(
            templates,
            page.unwrap_or(1),
            self.settings.per_page(per_page),
        ))
    }

    /// Categories of public templates with their template counts
    pub async fn categories(&self) -> EngineResult<Vec<CategoryCount>> {
        let templates = self.store.list_templates().await?;
        Ok(category_counts(
            templates
                .into_iter()
                .filter(|t| t.is_public)
                .map(|t| t.category),
        ))
    }

    /// Templates the actor owns, newest first
    pub async fn list_owned(&self, actor: &UserContext) -> EngineResult<Vec<Template>> {
        let mut templates: Vec<Template> = self
            .store
            .list_templates()
            .await?
            .into_iter()
            .filter(|t| actor.owns(&t.owner_id))
            .collect();
        templates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(templates)
    }

    pub async fn update(
        &self,
        actor: &UserContext,
        template_id: &Id,
        update: TemplateUpdate,
    ) -> EngineResult<Template> {
        let mut template = self.load_owned(actor, template_id).await?;

        if let Some(name) = update.name {
            template.name = check_name(&name)?;
        }
        if let Some(description) = update.description {
            check_description(&description)?;
            template.description = description;
        }
        if let Some(category) = update.category {
            template.category = check_category(&category)?;
        }
        if let Some(difficulty) = update.difficulty {
            template.difficulty = difficulty;
        }
        if let Some(tags) = update.tags {
            template.tags = tags;
        }
        if let Some(is_public) = update.is_public {
            template.is_public = is_public;
        }
        template.updated_at = Utc::now();

        // A private template cannot stay on the marketplace
        let mut batch = WriteBatch::single(WriteOp::PutTemplate(template.clone()));
        if !template.is_public {
            self.unlist(template_id, &mut batch).await?;
        }
        self.store.apply(batch).await?;
        Ok(template)
    }

    /// Delete a template the actor owns and take its listings off the
    /// marketplace. Instances created from it are unaffected.
    pub async fn delete(&self, actor: &UserContext, template_id: &Id) -> EngineResult<()> {
        self.load_owned(actor, template_id).await?;

        let mut batch = WriteBatch::single(WriteOp::DeleteTemplate {
            template_id: template_id.clone(),
        });
        self.unlist(template_id, &mut batch).await?;

        self.store.apply(batch).await?;
        info!("Deleted template {}", template_id);
        Ok(())
    }

    async fn unlist(&self, template_id: &Id, batch: &mut WriteBatch) -> EngineResult<()> {
        for mut listing in self.store.list_listings_for_target(template_id).await? {
            if listing.active {
                listing.active = false;
                batch.push(WriteOp::PutListing(listing));
            }
        }
        Ok(())
    }
}
