use anyhow::{anyhow, Context, Result};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};

use crate::model::{
    BlockDefinition, Id, Installation, Instance, ListingKind, MarketplaceListing, Rating,
    RatingAggregate, Snapshot, Template,
};
use crate::store::traits::{
    BatchStore, BlockDefinitionStore, Expect, InstanceStore, MarketplaceStore, RevisionConflict,
    SnapshotStore, TemplateStore, WriteBatch, WriteOp,
};

const SNAPSHOT_COLUMNS: &str = "id, instance_id, name, description, created_by, created_at, \
     instance_revision, block_count, connection_count, checksum, data, data_size";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Run the embedded migrations in `./migrations`
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn aggregate_from_row(row: &PgRow) -> RatingAggregate {
    RatingAggregate {
        avg: row.get("rating_avg"),
        count: row.get::<i32, _>("rating_count").max(0) as u32,
    }
}

fn definition_from_row(row: PgRow) -> BlockDefinition {
    let mut definition = row.get::<Json<BlockDefinition>, _>("doc").0;
    definition.install_count = row.get::<i64, _>("install_count").max(0) as u64;
    definition.rating = aggregate_from_row(&row);
    definition
}

fn template_from_row(row: PgRow) -> Template {
    let mut template = row.get::<Json<Template>, _>("doc").0;
    template.usage_count = row.get::<i64, _>("usage_count").max(0) as u64;
    template.rating = aggregate_from_row(&row);
    template
}

fn listing_from_row(row: PgRow) -> MarketplaceListing {
    let mut listing = row.get::<Json<MarketplaceListing>, _>("doc").0;
    listing.install_count = row.get::<i64, _>("install_count").max(0) as u64;
    listing.rating = aggregate_from_row(&row);
    listing
}

fn instance_from_row(row: PgRow) -> Instance {
    let mut instance = row.get::<Json<Instance>, _>("doc").0;
    instance.revision = row.get::<i64, _>("revision").max(0) as u64;
    instance
}

fn snapshot_from_row(row: PgRow) -> Snapshot {
    Snapshot {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        name: row.get("name"),
        description: row.get("description"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        instance_revision: row.get::<i64, _>("instance_revision").max(0) as u64,
        block_count: row.get("block_count"),
        connection_count: row.get("connection_count"),
        checksum: row.get("checksum"),
        payload: row.get("data"),
        data_size: row.get("data_size"),
    }
}

fn rating_from_row(row: PgRow) -> Rating {
    Rating {
        listing_id: row.get("listing_id"),
        user_id: row.get("user_id"),
        score: row.get::<i16, _>("score").clamp(0, u8::MAX as i16) as u8,
        review: row.get("review"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait::async_trait]
impl BlockDefinitionStore for PostgresStore {
    async fn get_block_definition(&self, id: &Id) -> Result<Option<BlockDefinition>> {
        let row = sqlx::query(
            "SELECT doc, install_count, rating_avg, rating_count FROM block_definitions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch block definition")?;

        Ok(row.map(definition_from_row))
    }

    async fn list_block_definitions(&self) -> Result<Vec<BlockDefinition>> {
        let rows = sqlx::query(
            "SELECT doc, install_count, rating_avg, rating_count FROM block_definitions ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list block definitions")?;

        Ok(rows.into_iter().map(definition_from_row).collect())
    }

    async fn list_installations_for_user(&self, user_id: &Id) -> Result<Vec<Installation>> {
        let rows = sqlx::query(
            "SELECT user_id, definition_id, listing_id, installed_at FROM installations \
             WHERE user_id = $1 ORDER BY installed_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list installations")?;

        Ok(rows
            .into_iter()
            .map(|row| Installation {
                user_id: row.get("user_id"),
                definition_id: row.get("definition_id"),
                listing_id: row.get("listing_id"),
                installed_at: row.get("installed_at"),
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl InstanceStore for PostgresStore {
    async fn get_instance(&self, id: &Id) -> Result<Option<Instance>> {
        let row = sqlx::query("SELECT doc, revision FROM instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch instance")?;

        Ok(row.map(instance_from_row))
    }

    async fn list_instances_for_owner(&self, owner_id: &Id) -> Result<Vec<Instance>> {
        let rows = sqlx::query(
            "SELECT doc, revision FROM instances WHERE owner_id = $1 ORDER BY created_at, id",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list instances")?;

        Ok(rows.into_iter().map(instance_from_row).collect())
    }
}

#[async_trait::async_trait]
impl SnapshotStore for PostgresStore {
    async fn get_snapshot(&self, id: &Id) -> Result<Option<Snapshot>> {
        let row = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch snapshot")?;

        Ok(row.map(snapshot_from_row))
    }

    async fn list_snapshots_for_instance(&self, instance_id: &Id) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE instance_id = $1 \
             ORDER BY created_at DESC, instance_revision DESC"
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list snapshots")?;

        Ok(rows.into_iter().map(snapshot_from_row).collect())
    }
}

#[async_trait::async_trait]
impl TemplateStore for PostgresStore {
    async fn get_template(&self, id: &Id) -> Result<Option<Template>> {
        let row = sqlx::query(
            "SELECT doc, usage_count, rating_avg, rating_count FROM templates WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch template")?;

        Ok(row.map(template_from_row))
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        let rows = sqlx::query(
            "SELECT doc, usage_count, rating_avg, rating_count FROM templates ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list templates")?;

        Ok(rows.into_iter().map(template_from_row).collect())
    }
}

#[async_trait::async_trait]
impl MarketplaceStore for PostgresStore {
    async fn get_listing(&self, id: &Id) -> Result<Option<MarketplaceListing>> {
        let row = sqlx::query(
            "SELECT doc, install_count, rating_avg, rating_count FROM listings WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch listing")?;

        Ok(row.map(listing_from_row))
    }

    async fn list_listings(&self) -> Result<Vec<MarketplaceListing>> {
        let rows = sqlx::query(
            "SELECT doc, install_count, rating_avg, rating_count FROM listings ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list listings")?;

        Ok(rows.into_iter().map(listing_from_row).collect())
    }

    async fn list_listings_for_target(&self, target_id: &Id) -> Result<Vec<MarketplaceListing>> {
        let rows = sqlx::query(
            "SELECT doc, install_count, rating_avg, rating_count FROM listings \
             WHERE target_id = $1 ORDER BY created_at, id",
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list listings for target")?;

        Ok(rows.into_iter().map(listing_from_row).collect())
    }

    async fn get_rating(&self, listing_id: &Id, user_id: &Id) -> Result<Option<Rating>> {
        let row = sqlx::query(
            "SELECT listing_id, user_id, score, review, created_at, updated_at FROM ratings \
             WHERE listing_id = $1 AND user_id = $2",
        )
        .bind(listing_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch rating")?;

        Ok(row.map(rating_from_row))
    }

    async fn list_ratings_for_listing(&self, listing_id: &Id) -> Result<Vec<Rating>> {
        let rows = sqlx::query(
            "SELECT listing_id, user_id, score, review, created_at, updated_at FROM ratings \
             WHERE listing_id = $1 ORDER BY updated_at DESC",
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list ratings")?;

        Ok(rows.into_iter().map(rating_from_row).collect())
    }
}

async fn current_revision(conn: &mut PgConnection, instance_id: &Id) -> Result<Option<u64>> {
    let revision: Option<i64> = sqlx::query_scalar("SELECT revision FROM instances WHERE id = $1")
        .bind(instance_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to read instance revision")?;
    Ok(revision.map(|r| r.max(0) as u64))
}

async fn put_instance(conn: &mut PgConnection, instance: Instance, expect: Expect) -> Result<()> {
    let revision = instance.revision as i64;
    let affected = match expect {
        Expect::Absent => sqlx::query(
            "INSERT INTO instances (id, owner_id, revision, doc, created_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (id) DO NOTHING",
        )
        .bind(&instance.id)
        .bind(&instance.owner_id)
        .bind(revision)
        .bind(Json(&instance))
        .bind(instance.created_at)
        .execute(&mut *conn)
        .await
        .context("Failed to insert instance")?
        .rows_affected(),
        Expect::Revision(expected) => sqlx::query(
            "UPDATE instances SET revision = $2, doc = $3 WHERE id = $1 AND revision = $4",
        )
        .bind(&instance.id)
        .bind(revision)
        .bind(Json(&instance))
        .bind(expected as i64)
        .execute(&mut *conn)
        .await
        .context("Failed to update instance")?
        .rows_affected(),
    };

    if affected == 0 {
        let found = current_revision(conn, &instance.id).await?;
        return Err(RevisionConflict {
            instance_id: instance.id,
            expected: expect,
            found,
        }
        .into());
    }
    Ok(())
}

async fn delete_instance(conn: &mut PgConnection, instance_id: Id, expect: Expect) -> Result<()> {
    let found = current_revision(conn, &instance_id).await?;
    let satisfied = match expect {
        Expect::Absent => found.is_none(),
        Expect::Revision(expected) => found == Some(expected),
    };
    if !satisfied {
        return Err(RevisionConflict {
            instance_id,
            expected: expect,
            found,
        }
        .into());
    }

    // Snapshots go with the instance through ON DELETE CASCADE
    let result = sqlx::query("DELETE FROM instances WHERE id = $1 AND revision = $2")
        .bind(&instance_id)
        .bind(found.unwrap_or_default() as i64)
        .execute(&mut *conn)
        .await
        .context("Failed to delete instance")?;

    if found.is_some() && result.rows_affected() == 0 {
        let now = current_revision(conn, &instance_id).await?;
        return Err(RevisionConflict {
            instance_id,
            expected: expect,
            found: now,
        }
        .into());
    }
    Ok(())
}

/// Recompute a listing's aggregate from its ratings and mirror it onto the
/// wrapped item. The listing row must already be locked by the caller.
async fn refresh_rating(
    conn: &mut PgConnection,
    listing_id: &Id,
    kind: ListingKind,
    target_id: &Id,
) -> Result<()> {
    let scores: Vec<i16> = sqlx::query_scalar("SELECT score FROM ratings WHERE listing_id = $1")
        .bind(listing_id)
        .fetch_all(&mut *conn)
        .await
        .context("Failed to read ratings")?;
    let aggregate =
        RatingAggregate::from_scores(scores.into_iter().map(|s| s.clamp(0, 255) as u8));

    sqlx::query("UPDATE listings SET rating_avg = $2, rating_count = $3 WHERE id = $1")
        .bind(listing_id)
        .bind(aggregate.avg)
        .bind(aggregate.count as i32)
        .execute(&mut *conn)
        .await
        .context("Failed to update listing rating")?;

    let mirror = match kind {
        ListingKind::Block => {
            "UPDATE block_definitions SET rating_avg = $2, rating_count = $3 WHERE id = $1"
        }
        ListingKind::Template => {
            "UPDATE templates SET rating_avg = $2, rating_count = $3 WHERE id = $1"
        }
    };
    sqlx::query(mirror)
        .bind(target_id)
        .bind(aggregate.avg)
        .bind(aggregate.count as i32)
        .execute(&mut *conn)
        .await
        .context("Failed to mirror rating aggregate")?;

    Ok(())
}

async fn lock_listing(conn: &mut PgConnection, listing_id: &Id) -> Result<(ListingKind, Id)> {
    let row = sqlx::query("SELECT kind, target_id FROM listings WHERE id = $1 FOR UPDATE")
        .bind(listing_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to lock listing")?
        .ok_or_else(|| anyhow!("Listing '{}' not found", listing_id))?;

    let kind: String = row.get("kind");
    let kind = kind.parse::<ListingKind>().map_err(|e| anyhow!(e))?;
    Ok((kind, row.get("target_id")))
}

async fn apply_op(conn: &mut PgConnection, op: WriteOp) -> Result<()> {
    match op {
        WriteOp::PutInstance { instance, expect } => put_instance(conn, instance, expect).await?,
        WriteOp::DeleteInstance {
            instance_id,
            expect,
        } => delete_instance(conn, instance_id, expect).await?,
        WriteOp::InsertSnapshot(snapshot) => {
            sqlx::query(&format!(
                "INSERT INTO snapshots ({SNAPSHOT_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
            ))
            .bind(&snapshot.id)
            .bind(&snapshot.instance_id)
            .bind(&snapshot.name)
            .bind(&snapshot.description)
            .bind(&snapshot.created_by)
            .bind(snapshot.created_at)
            .bind(snapshot.instance_revision as i64)
            .bind(snapshot.block_count)
            .bind(snapshot.connection_count)
            .bind(&snapshot.checksum)
            .bind(&snapshot.payload)
            .bind(snapshot.data_size)
            .execute(&mut *conn)
            .await
            .context("Failed to insert snapshot")?;
        }
        WriteOp::DeleteSnapshot { snapshot_id } => {
            sqlx::query("DELETE FROM snapshots WHERE id = $1")
                .bind(&snapshot_id)
                .execute(&mut *conn)
                .await
                .context("Failed to delete snapshot")?;
        }
        WriteOp::PutTemplate(template) => {
            sqlx::query(
                "INSERT INTO templates (id, owner_id, is_public, doc, usage_count, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (id) DO UPDATE SET \
                     owner_id = EXCLUDED.owner_id, \
                     is_public = EXCLUDED.is_public, \
                     doc = EXCLUDED.doc",
            )
            .bind(&template.id)
            .bind(&template.owner_id)
            .bind(template.is_public)
            .bind(Json(&template))
            .bind(template.usage_count as i64)
            .bind(template.created_at)
            .execute(&mut *conn)
            .await
            .context("Failed to upsert template")?;
        }
        WriteOp::DeleteTemplate { template_id } => {
            sqlx::query("DELETE FROM templates WHERE id = $1")
                .bind(&template_id)
                .execute(&mut *conn)
                .await
                .context("Failed to delete template")?;
        }
        WriteOp::IncrementTemplateUsage { template_id } => {
            let result =
                sqlx::query("UPDATE templates SET usage_count = usage_count + 1 WHERE id = $1")
                    .bind(&template_id)
                    .execute(&mut *conn)
                    .await
                    .context("Failed to increment template usage")?;
            if result.rows_affected() == 0 {
                return Err(anyhow!("Template '{}' not found", template_id));
            }
        }
        WriteOp::PutBlockDefinition(definition) => {
            sqlx::query(
                "INSERT INTO block_definitions (id, author, visibility, builtin, doc, install_count, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (id) DO UPDATE SET \
                     author = EXCLUDED.author, \
                     visibility = EXCLUDED.visibility, \
                     builtin = EXCLUDED.builtin, \
                     doc = EXCLUDED.doc",
            )
            .bind(&definition.id)
            .bind(&definition.author)
            .bind(definition.visibility.to_string())
            .bind(definition.builtin)
            .bind(Json(&definition))
            .bind(definition.install_count as i64)
            .bind(definition.created_at)
            .execute(&mut *conn)
            .await
            .context("Failed to upsert block definition")?;
        }
        WriteOp::DeleteBlockDefinition { definition_id } => {
            // Grants go with the definition through ON DELETE CASCADE
            sqlx::query("DELETE FROM block_definitions WHERE id = $1")
                .bind(&definition_id)
                .execute(&mut *conn)
                .await
                .context("Failed to delete block definition")?;
        }
        WriteOp::GrantBlock(installation) => {
            sqlx::query(
                "INSERT INTO installations (user_id, definition_id, listing_id, installed_at) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (user_id, definition_id) DO NOTHING",
            )
            .bind(&installation.user_id)
            .bind(&installation.definition_id)
            .bind(&installation.listing_id)
            .bind(installation.installed_at)
            .execute(&mut *conn)
            .await
            .context("Failed to grant block")?;
        }
        WriteOp::RevokeBlock {
            user_id,
            definition_id,
        } => {
            sqlx::query("DELETE FROM installations WHERE user_id = $1 AND definition_id = $2")
                .bind(&user_id)
                .bind(&definition_id)
                .execute(&mut *conn)
                .await
                .context("Failed to revoke block")?;
        }
        WriteOp::PutListing(listing) => {
            sqlx::query(
                "INSERT INTO listings (id, kind, target_id, doc, install_count, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (id) DO UPDATE SET \
                     kind = EXCLUDED.kind, \
                     target_id = EXCLUDED.target_id, \
                     doc = EXCLUDED.doc",
            )
            .bind(&listing.id)
            .bind(listing.kind.to_string())
            .bind(&listing.target_id)
            .bind(Json(&listing))
            .bind(listing.install_count as i64)
            .bind(listing.created_at)
            .execute(&mut *conn)
            .await
            .context("Failed to upsert listing")?;
        }
        WriteOp::IncrementInstallCount { listing_id } => {
            let (kind, target_id) = lock_listing(conn, &listing_id).await?;
            sqlx::query("UPDATE listings SET install_count = install_count + 1 WHERE id = $1")
                .bind(&listing_id)
                .execute(&mut *conn)
                .await
                .context("Failed to increment install count")?;

            if kind == ListingKind::Block {
                sqlx::query(
                    "UPDATE block_definitions SET install_count = install_count + 1 WHERE id = $1",
                )
                .bind(&target_id)
                .execute(&mut *conn)
                .await
                .context("Failed to increment definition install count")?;
            }
        }
        WriteOp::UpsertRating(rating) => {
            let (kind, target_id) = lock_listing(conn, &rating.listing_id).await?;
            sqlx::query(
                "INSERT INTO ratings (listing_id, user_id, score, review, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (listing_id, user_id) DO UPDATE SET \
                     score = EXCLUDED.score, \
                     review = EXCLUDED.review, \
                     updated_at = EXCLUDED.updated_at",
            )
            .bind(&rating.listing_id)
            .bind(&rating.user_id)
            .bind(rating.score as i16)
            .bind(&rating.review)
            .bind(rating.created_at)
            .bind(rating.updated_at)
            .execute(&mut *conn)
            .await
            .context("Failed to upsert rating")?;

            refresh_rating(conn, &rating.listing_id, kind, &target_id).await?;
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl BatchStore for PostgresStore {
    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        for op in batch.ops {
            // Dropping the transaction on error rolls it back
            apply_op(&mut tx, op).await?;
        }

        tx.commit().await.context("Failed to commit transaction")?;
        Ok(())
    }
}
