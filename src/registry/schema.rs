// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

diesel::table! {
    entries (id) {
        id -> Integer,
        remote -> Text,
        category -> Text,
        package -> Text,
        kind -> Text,
        version -> Text,
        pinned -> Bool,
    }
}

diesel::table! {
    files (id) {
        id -> Integer,
        entry_id -> Integer,
        path -> Text,
        main -> Bool,
        section -> Nullable<Text>,
    }
}

diesel::joinable!(files -> entries (entry_id));
diesel::allow_tables_to_appear_in_same_query!(entries, files);
