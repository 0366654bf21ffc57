use state_machines::state_machine;

state_machine! {
    name: BuildMachine,
    state: BuildState,
    initial: Ready,
    states: [Ready, MetadataInserted, Extracted, Enriched, Embedded, IndexPopulated, Finalized, Failed],
    events {
        insert_metadata { transition: { from: Ready, to: MetadataInserted } }
        extract { transition: { from: MetadataInserted, to: Extracted } }
        enrich { transition: { from: Extracted, to: Enriched } }
        embed { transition: { from: Enriched, to: Embedded } }
        populate_index { transition: { from: Embedded, to: IndexPopulated } }
        finalize { transition: { from: IndexPopulated, to: Finalized } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: MetadataInserted, to: Failed }
            transition: { from: Extracted, to: Failed }
            transition: { from: Enriched, to: Failed }
            transition: { from: Embedded, to: Failed }
            transition: { from: IndexPopulated, to: Failed }
        }
    }
}

pub fn ready() -> BuildMachine<(), Ready> {
    BuildMachine::new(())
}
