// reqgraph schema - requirement graph tables for Diesel ORM

diesel::table! {
    schema_versions (id) {
        id -> Integer,
        version -> Text,
        name -> Text,
        features -> Text,
        introduced_at -> Text,
    }
}

// ============================================================================
// Accounts and sessions
// ============================================================================

diesel::table! {
    users (id) {
        id -> Integer,
        username -> Text,
        password_hash -> Text,
        email -> Nullable<Text>,
        is_active -> Bool,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    sessions (token) {
        token -> Text,                   // UUID, sent as the session cookie
        user_id -> Integer,
        created_at -> Text,
        expires_at -> Text,
    }
}

// ============================================================================
// Tenancy
// ============================================================================

diesel::table! {
    projects (id) {
        id -> Integer,
        name -> Text,
        description -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    project_members (user_id, project_id) {
        user_id -> Integer,
        project_id -> Integer,
        added_at -> Text,
    }
}

diesel::table! {
    requirement_groups (id) {
        id -> Integer,
        name -> Text,                    // unique within project_id
        description -> Nullable<Text>,
        parent_id -> Nullable<Integer>,  // self-reference, same project
        project_id -> Integer,
        created_at -> Text,
        updated_at -> Text,
    }
}

// ============================================================================
// Requirement graph
// ============================================================================

diesel::table! {
    requirements (id) {
        id -> Integer,
        requirement_id -> Text,          // external key, unique within project_id
        title -> Text,
        description -> Nullable<Text>,
        status -> Text,
        chapter -> Nullable<Text>,
        group_id -> Integer,
        project_id -> Integer,
        graph_x -> Nullable<Double>,
        graph_y -> Nullable<Double>,
        created_by -> Nullable<Text>,
        updated_by -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    requirement_links (parent_id, child_id) {
        parent_id -> Integer,
        child_id -> Integer,
        created_at -> Text,
    }
}

diesel::table! {
    field_changes (id) {
        id -> Integer,
        requirement_id -> Integer,       // FK to requirements.id (internal)
        field_name -> Text,
        old_value -> Nullable<Text>,
        new_value -> Nullable<Text>,
        changed_by -> Text,
        changed_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    users,
    sessions,
    projects,
    project_members,
    requirement_groups,
    requirements,
    requirement_links,
    field_changes,
);
