diesel::table! {
    categories (id) {
        id -> Int8,
        name -> Text,
        created_at -> Timestamptz,
        updated_at -> Nullable<Timestamptz>,
        is_archived -> Bool,
    }
}

diesel::table! {
    products (id) {
        id -> Int8,
        name -> Text,
        price -> Int8,
        category_id -> Int8,
        created_at -> Timestamptz,
        updated_at -> Nullable<Timestamptz>,
        is_archived -> Bool,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Int8,
        event_id -> Uuid,
        product_id -> Int8,
        event_type -> Text,
        payload -> Bytea,
        status -> Text,
        created_at -> Timestamptz,
        processing_started_at -> Nullable<Timestamptz>,
        processed_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(products -> categories (category_id));

diesel::allow_tables_to_appear_in_same_query!(
    categories,
    products,
    outbox_events,
);
