/// Declares a module `$mod_name` handing out process-wide unique ids
///
/// Released ids may be handed out again, but never while still in use.
macro_rules! id_gen {
    ($mod_name:ident) => {
        mod $mod_name {
            use once_cell::sync::Lazy;
            use std::{collections::HashSet, sync::Mutex};

            static ID_DATA: Lazy<Mutex<(HashSet<u64>, u64)>> = Lazy::new(|| Mutex::new((HashSet::new(), 1)));

            pub(crate) fn next() -> u64 {
                let (id_set, counter) = &mut *$crate::utils::unpoison(ID_DATA.lock());

                while *counter == 0 || !id_set.insert(*counter) {
                    *counter = counter.wrapping_add(1);
                }

                let new_id = *counter;
                *counter = counter.wrapping_add(1);
                new_id
            }

            pub(crate) fn remove(id: u64) -> bool {
                $crate::utils::unpoison(ID_DATA.lock()).0.remove(&id)
            }
        }
    };
}

pub(crate) use id_gen;
