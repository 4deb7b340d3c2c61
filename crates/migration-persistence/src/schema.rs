// Esquema Diesel compartido por SQLite y Postgres.
// Tablas: documents, migration_checkpoints, checkpoint_history
diesel::table! {
    documents (collection, doc_key) {
        collection -> Text,
        doc_key -> Text,
        body -> Text,
        revision -> BigInt,
    }
}
diesel::table! {
    migration_checkpoints (name) {
        name -> Text,
        revision -> BigInt,
        plan_version -> BigInt,
        active_version -> Nullable<BigInt>,
        direction -> Text,
        resume_token -> Nullable<Text>,
        status -> Text,
        lease_owner -> Nullable<Text>,
        lease_renewed_at_ts -> Nullable<BigInt>,
        migrated_count -> BigInt,
        skipped_count -> BigInt,
        last_error -> Nullable<Text>,
        updated_at_ts -> BigInt,
    }
}
diesel::table! {
    checkpoint_history (id) {
        id -> Text,
        name -> Text,
        revision -> BigInt,
        snapshot -> Text,
        recorded_at_ts -> BigInt,
    }
}
