diesel::table! {
    accounts (id) {
        id -> Int8,
        status -> Varchar,
        jwk -> Text,
        contacts -> Text,
        eab -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Int8,
        account_id -> Int8,
        status -> Varchar,
        expires -> Timestamptz,
        authorizations -> Text,
        cert_req_meta -> Nullable<Text>,
        csr -> Nullable<Bytea>,
        certificate -> Nullable<Bytea>,
        cert_not_after -> Nullable<Timestamptz>,
        error -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(orders -> accounts (account_id));

diesel::allow_tables_to_appear_in_same_query!(
    accounts,
    orders,
);
