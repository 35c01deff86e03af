// Repocache schema - settings, projects and cache tables for Diesel ORM

diesel::table! {
    schema_versions (version) {
        version -> Integer,
        name -> Text,
        applied_at -> BigInt,
    }
}

diesel::table! {
    app_settings (key) {
        key -> Text,
        value -> Text,
        updated_at -> BigInt,
    }
}

diesel::table! {
    projects (id) {
        id -> Text,
        name -> Text,
        path -> Text,
        last_opened_at -> BigInt,
        created_at -> BigInt,
    }
}

diesel::table! {
    project_prefs (project_id) {
        project_id -> Text,
        include_ignored -> Bool,
        changed_only -> Bool,
        expanded_dirs_json -> Text,         // JSON array, order preserved
        selected_path -> Nullable<Text>,
        scroll_top -> Integer,
        active_worktree_path -> Nullable<Text>,
        updated_at -> BigInt,
    }
}

// ============================================================================
// Cache Tables - every row references projects(id) with ON DELETE CASCADE
// ============================================================================

diesel::table! {
    repo_cache (id) {
        id -> Integer,
        project_id -> Text,
        fingerprint -> Text,             // RepoFingerprint::cache_key()
        include_ignored -> Bool,
        tree_json -> Nullable<Text>,
        status_json -> Nullable<Text>,
        size_bytes -> Nullable<BigInt>,
        accessed_at -> BigInt,
        created_at -> BigInt,
    }
}

diesel::table! {
    patch_cache (id) {
        id -> Integer,
        project_id -> Text,
        file_path -> Text,
        scope -> Text,                   // 'staged', 'unstaged', 'untracked'
        fingerprint -> Text,
        patch -> Text,
        size_bytes -> Nullable<BigInt>,
        accessed_at -> BigInt,
        created_at -> BigInt,
    }
}

diesel::table! {
    log_cache (project_id) {
        project_id -> Text,
        commits_json -> Text,
        head_oid -> Nullable<Text>,
        unpushed_json -> Nullable<Text>,
        updated_at -> BigInt,
    }
}

diesel::joinable!(project_prefs -> projects (project_id));
diesel::joinable!(repo_cache -> projects (project_id));
diesel::joinable!(patch_cache -> projects (project_id));
diesel::joinable!(log_cache -> projects (project_id));

diesel::allow_tables_to_appear_in_same_query!(
    app_settings,
    projects,
    project_prefs,
    repo_cache,
    patch_cache,
    log_cache,
);
