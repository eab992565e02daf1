diesel::table! {
    items (id) {
        id -> Int8,
        title -> Varchar,
        author -> Nullable<Varchar>,
        stock -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    rentals (id) {
        id -> Int8,
        user_id -> Int8,
        item_id -> Int8,
        rented_at -> Timestamptz,
        returned_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

// No foreign key backs this; rentals may outlive their item.
diesel::joinable!(rentals -> items (item_id));

diesel::allow_tables_to_appear_in_same_query!(
    items,
    rentals,
);
